// Copyright 2023 The TabletMeta Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cloning copies tablet rows of a source table while the source keeps splitting, merging and compacting.
//!
//! Copied rows are verified against source in passes. A copied tablet whose files are no longer all present
//! in its source tablets is copied again. Verified tablets are marked and left alone in later passes. Once a
//! pass copies nothing, markers are replaced by fresh directories.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info};

use super::context::MetadataContext;
use super::extent::{compare_end_rows, decode_prev_row, Extent};
use super::schema::{
    CLONED_COLUMN,
    CLONED_FAMILY,
    CURRENT_LOCATION_FAMILY,
    DATAFILE_FAMILY,
    DIRECTORY_COLUMN,
    LAST_LOCATION_FAMILY,
    PREV_ROW_COLUMN,
    TIME_COLUMN,
};
use crate::error::{MetaError, Result};
use crate::keys::{self, METADATA_TABLE_ID};
use crate::store::{group_rows, Cell, Column, Mutation, RowCells, ScanRange};

const RESTART_DELAY: Duration = Duration::from_millis(100);

/// File reference of `file` from a table other than `table` owning it.
fn foreign_file(table: &str, file: &str) -> String {
    match file.starts_with("../") {
        true => file.to_string(),
        false => format!("../{table}{file}"),
    }
}

fn is_cloned_column(cell: &Cell) -> bool {
    match cell.column.family.as_str() {
        DATAFILE_FAMILY | CURRENT_LOCATION_FAMILY | LAST_LOCATION_FAMILY | CLONED_FAMILY => true,
        _ => cell.column == PREV_ROW_COLUMN || cell.column == TIME_COLUMN,
    }
}

struct CloneTablet {
    extent: Extent,
    row: RowCells,
    files: BTreeSet<String>,
    cloned: bool,
}

impl CloneTablet {
    fn from_row(source: &str, row: RowCells) -> Result<Self> {
        let prev_row = row.get(&PREV_ROW_COLUMN).ok_or_else(|| {
            MetaError::corrupted(format!("tablet row {:?} has no prev row", String::from_utf8_lossy(&row.row)))
        })?;
        let extent = Extent::from_metadata_row(&row.row, decode_prev_row(&prev_row.value)?)?;
        let files = row.family(DATAFILE_FAMILY).map(|cell| foreign_file(source, &cell.column.qualifier)).collect();
        let cloned = row.family(CLONED_FAMILY).next().is_some();
        Ok(Self { extent, row, files, cloned })
    }

    /// Row of this tablet in table `dest` with files referenced from `source`.
    fn clone_mutation(&self, source: &str, dest: &str) -> Mutation {
        let mut mutation = Mutation::new(keys::tablet_row(dest, self.extent.end_row()));
        for cell in self.row.cells.iter() {
            let column = &cell.column;
            match column.family.as_str() {
                DATAFILE_FAMILY => {
                    let file = foreign_file(source, &column.qualifier);
                    mutation.put(Column::new(DATAFILE_FAMILY, file), cell.value.clone());
                },
                CURRENT_LOCATION_FAMILY => {
                    mutation.put(Column::new(LAST_LOCATION_FAMILY, column.qualifier.clone()), cell.value.clone());
                },
                LAST_LOCATION_FAMILY => {},
                _ => mutation.put(column.clone(), cell.value.clone()),
            }
        }
        mutation
    }
}

/// Clones metadata of one table into another.
pub struct CloneEngine {
    context: MetadataContext,
}

impl CloneEngine {
    pub fn new(context: MetadataContext) -> Self {
        Self { context }
    }

    async fn scan_tablets(&self, table: &str, source: &str) -> Result<Vec<CloneTablet>> {
        let range = ScanRange::new(keys::table_bounds(table)).with_families([
            DATAFILE_FAMILY,
            CURRENT_LOCATION_FAMILY,
            LAST_LOCATION_FAMILY,
            CLONED_FAMILY,
            PREV_ROW_COLUMN.family.as_str(),
            TIME_COLUMN.family.as_str(),
        ]);
        let cells = self.context.writer().scan(&range).await?;
        let rows = group_rows(cells.into_iter().filter(is_cloned_column).collect());
        rows.into_iter().map(|row| CloneTablet::from_row(source, row)).collect()
    }

    /// Tablets of source table, which must chain from start to end of table without gaps.
    async fn scan_source(&self, source: &str) -> Result<Vec<CloneTablet>> {
        let tablets = self.scan_tablets(source, source).await?;
        let mut prev_end_row: Option<&[u8]> = None;
        for tablet in tablets.iter() {
            if tablet.extent.prev_end_row() != prev_end_row {
                return Err(MetaError::source_mutated(source, format!("tablet {} not chained", tablet.extent)));
            }
            prev_end_row = tablet.extent.end_row();
        }
        if let Some(last) = tablets.last() {
            if last.extent.end_row().is_some() {
                return Err(MetaError::source_mutated(source, format!("last tablet {} not end of table", last.extent)));
            }
        }
        Ok(tablets)
    }

    /// Copies all tablet rows of `source` into `dest`.
    pub async fn initialize(&self, source: &str, dest: &str) -> Result<()> {
        let tablets = self.scan_source(source).await?;
        if tablets.is_empty() {
            return Err(MetaError::table_not_found(source));
        }
        let mut writer = self.context.batch_writer();
        for tablet in tablets.iter() {
            writer.add(tablet.clone_mutation(source, dest)).await?;
        }
        writer.close().await
    }

    /// Verifies copied tablets against source, returns number of tablets copied again.
    ///
    /// Fails with [MetaError::TableNotFound] if either table is gone, and with [MetaError::SourceMutated] if
    /// source tablets were merged since copied or copied tablets no longer cover source.
    pub async fn check(&self, source: &str, dest: &str) -> Result<usize> {
        let sources = self.scan_source(source).await?;
        if sources.is_empty() {
            return Err(MetaError::table_not_found(source));
        }
        let clones = self.scan_tablets(dest, source).await?;
        if clones.is_empty() {
            return Err(MetaError::table_not_found(dest));
        }
        let mut sources = sources.iter();
        let mut writer = self.context.batch_writer();
        let mut rewrites = 0;
        for clone in clones.iter() {
            let mut source_tablets = Vec::new();
            let mut source_files = BTreeSet::new();
            let mut covered = false;
            for tablet in sources.by_ref() {
                let ordering = compare_end_rows(clone.extent.end_row(), tablet.extent.end_row());
                if ordering == Ordering::Less {
                    return Err(MetaError::source_mutated(
                        source,
                        format!("tablet {} spans over cloned tablet {}", tablet.extent, clone.extent),
                    ));
                }
                source_tablets.push(tablet);
                source_files.extend(tablet.files.iter().cloned());
                if ordering == Ordering::Equal {
                    covered = true;
                    break;
                }
            }
            if !covered {
                return Err(MetaError::source_mutated(source, format!("no source tablet ends with {}", clone.extent)));
            }
            if clone.cloned {
                continue;
            }
            if clone.files.is_subset(&source_files) {
                let mut mutation = Mutation::new(clone.row.row.clone());
                mutation.put(CLONED_COLUMN, "OK");
                writer.add(mutation).await?;
                continue;
            }
            debug!("clone tablet {} references files gone from source, copy again", clone.extent);
            let mut mutation = Mutation::new(clone.row.row.clone());
            for cell in clone.row.cells.iter() {
                mutation.delete(cell.column.clone());
            }
            writer.add(mutation).await?;
            for tablet in source_tablets {
                writer.add(tablet.clone_mutation(source, dest)).await?;
            }
            rewrites += 1;
        }
        if let Some(tablet) = sources.next() {
            return Err(MetaError::source_mutated(source, format!("tablet {} has no cloned tablet", tablet.extent)));
        }
        writer.close().await?;
        Ok(rewrites)
    }

    /// Replaces clone markers with fresh directories, numbered after any `/c-` directory already in `dest`.
    pub async fn finalize(&self, dest: &str) -> Result<usize> {
        let range =
            ScanRange::new(keys::table_bounds(dest)).with_families([CLONED_FAMILY, DIRECTORY_COLUMN.family.as_str()]);
        let cells = self.context.writer().scan(&range).await?;
        let mut next_dir = cells
            .iter()
            .filter(|cell| cell.column == DIRECTORY_COLUMN)
            .filter_map(|cell| std::str::from_utf8(&cell.value).ok()?.strip_prefix("/c-"))
            .filter_map(|counter| u64::from_str_radix(counter, 16).ok())
            .max()
            .map_or(0, |counter| counter + 1);
        let mut writer = self.context.batch_writer();
        let mut finalized = 0;
        for cell in cells.iter().filter(|cell| cell.column.family == CLONED_FAMILY) {
            let mut mutation = Mutation::new(cell.row.clone());
            mutation.delete(cell.column.clone());
            mutation.put(DIRECTORY_COLUMN, format!("/c-{next_dir:08x}"));
            writer.add(mutation).await?;
            next_dir += 1;
            finalized += 1;
        }
        writer.close().await?;
        Ok(finalized)
    }

    /// Clones `source` into `dest`, restarting from scratch whenever source tablets merge under it.
    pub async fn clone_table(&self, source: &str, dest: &str) -> Result<()> {
        if source == METADATA_TABLE_ID || dest == METADATA_TABLE_ID {
            return Err(MetaError::invalid_argument("metadata table can not be cloned"));
        }
        loop {
            match self.copy(source, dest).await {
                Ok(()) => break,
                Err(MetaError::SourceMutated { message, .. }) => {
                    info!("source table {source} mutated during clone to {dest}, restart: {message}");
                    self.context.delete_table(dest, false, None).await?;
                    tokio::time::sleep(RESTART_DELAY).await;
                },
                Err(err) => return Err(err),
            }
        }
        let tablets = self.finalize(dest).await?;
        info!("cloned table {source} to {dest} with {tablets} tablets");
        Ok(())
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        self.initialize(source, dest).await?;
        loop {
            let rewrites = self.check(source, dest).await?;
            if rewrites == 0 {
                return Ok(());
            }
            debug!("copied {rewrites} tablets again in cloning {source} to {dest}");
        }
    }
}
