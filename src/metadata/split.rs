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

//! Splitting a tablet takes three row mutations:
//!
//! 1. [MetadataContext::split_tablet] shrinks upper child in place and records how to undo it.
//! 2. [MetadataContext::add_new_tablet] creates lower child.
//! 3. [MetadataContext::finish_split] gives upper child its share of files and drops split markers.
//!
//! [SplitRepairer] completes or rolls back a split that crashed in between.

use std::collections::BTreeSet;

use tracing::info;

use super::context::MetadataContext;
use super::datafile::{split_data_files, DataFiles};
use super::extent::{encode_prev_row, Extent};
use super::schema::{
    TabletMetadata,
    CHOPPED_COLUMN,
    DATAFILE_FAMILY,
    OLD_PREV_ROW_COLUMN,
    PREV_ROW_COLUMN,
    SPLIT_RATIO_COLUMN,
};
use crate::cluster::LockId;
use crate::error::{MetaError, Result};
use crate::keys;
use crate::store::{Column, Mutation, RowCells, ScanRange};

impl MetadataContext {
    /// Shrinks tablet to `extent`, its upper part after split, remembering its prior prev row.
    pub async fn split_tablet(
        &self,
        extent: &Extent,
        old_prev_end_row: Option<&[u8]>,
        split_ratio: f64,
        lock: Option<&LockId>,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&split_ratio) {
            return Err(MetaError::invalid_argument(format!("split ratio {split_ratio} of {extent} out of [0, 1]")));
        }
        let mut mutation = extent.prev_row_mutation();
        mutation.put(SPLIT_RATIO_COLUMN, split_ratio.to_string());
        mutation.put(OLD_PREV_ROW_COLUMN, encode_prev_row(old_prev_end_row));
        mutation.delete(CHOPPED_COLUMN);
        self.writer().update(mutation, lock).await
    }

    /// Settles files of upper child and clears split markers.
    pub async fn finish_split(
        &self,
        extent: &Extent,
        files: &DataFiles,
        to_remove: &BTreeSet<String>,
        lock: Option<&LockId>,
    ) -> Result<()> {
        let mut mutation = Mutation::new(extent.metadata_row());
        mutation.delete(SPLIT_RATIO_COLUMN);
        mutation.delete(OLD_PREV_ROW_COLUMN);
        mutation.delete(CHOPPED_COLUMN);
        for (path, value) in files.iter() {
            mutation.put(Column::new(DATAFILE_FAMILY, path.as_str()), value.encode());
        }
        for path in to_remove.iter() {
            mutation.delete(Column::new(DATAFILE_FAMILY, path.as_str()));
        }
        self.writer().update(mutation, lock).await
    }

    /// Restores tablet `extent`, upper part of an unfinished split, to its range before split.
    pub async fn roll_back_split(
        &self,
        extent: &Extent,
        old_prev_end_row: Option<&[u8]>,
        lock: Option<&LockId>,
    ) -> Result<Extent> {
        let restored = Extent::new(extent.table(), old_prev_end_row, extent.end_row())?;
        let mut mutation = restored.prev_row_mutation();
        mutation.delete(SPLIT_RATIO_COLUMN);
        mutation.delete(OLD_PREV_ROW_COLUMN);
        self.writer().update(mutation, lock).await?;
        Ok(restored)
    }
}

/// Brings tablets left in the middle of a split to a consistent state.
pub struct SplitRepairer {
    context: MetadataContext,
}

impl SplitRepairer {
    pub fn new(context: MetadataContext) -> Self {
        Self { context }
    }

    /// Repairs tablet in `row` if it is splitting, returns resulting extent of repaired tablet.
    ///
    /// Split rolls back if lower child was never created, otherwise it finishes with files of upper child
    /// recomputed from split ratio.
    pub async fn repair(&self, row: &RowCells, lock: Option<&LockId>) -> Result<Option<Extent>> {
        let tablet = TabletMetadata::from_row(row)?;
        if !tablet.is_splitting() {
            return Ok(None);
        }
        let Some(extent) = tablet.extent.as_ref() else {
            return Err(MetaError::corrupted("splitting tablet without extent"));
        };
        let corrupted = |what: &str| MetaError::corrupted(format!("splitting tablet {extent} has no {what}"));
        let split_ratio = tablet.split_ratio.ok_or_else(|| corrupted("split ratio"))?;
        let old_prev_end_row = tablet.old_prev_row.as_ref().ok_or_else(|| corrupted("old prev row"))?;
        if tablet.time.is_none() {
            return Err(corrupted("time"));
        }
        let prev_end_row = extent.prev_end_row().ok_or_else(|| corrupted("prev row"))?;

        let lower_row = keys::tablet_row(extent.table(), Some(prev_end_row));
        let range = ScanRange::row(lower_row).with_families([PREV_ROW_COLUMN.family.as_str()]);
        if self.context.writer().scan(&range).await?.is_empty() {
            let restored = self.context.roll_back_split(extent, old_prev_end_row.as_deref(), lock).await?;
            info!("rolled back split of {extent} to {restored}");
            return Ok(Some(restored));
        }

        let (_, high) = split_data_files(&tablet.files, split_ratio);
        self.context.finish_split(extent, &high, &BTreeSet::new(), lock).await?;
        info!("finished split of {extent} with ratio {split_ratio}");
        Ok(Some(extent.clone()))
    }

    /// Repairs all splitting tablets of `table`.
    pub async fn repair_table(&self, table: &str, lock: Option<&LockId>) -> Result<Vec<Extent>> {
        let rows = self.context.writer().scan_rows(&ScanRange::new(keys::table_bounds(table))).await?;
        let mut repaired = Vec::new();
        for row in rows.iter() {
            if let Some(extent) = self.repair(row, lock).await? {
                repaired.push(extent);
            }
        }
        Ok(repaired)
    }
}
