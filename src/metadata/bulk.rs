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

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::context::MetadataContext;
use super::datafile::DataFiles;
use super::extent::Extent;
use super::schema::{decimal_value, BULKFILE_FAMILY, DATAFILE_FAMILY, FLAG_COLUMN};
use crate::cluster::LockId;
use crate::error::Result;
use crate::keys;
use crate::store::{Column, Mutation, ScanRange};

impl MetadataContext {
    /// Assigns files imported by bulk transaction `tid` to tablet.
    pub async fn record_bulk_files(
        &self,
        extent: &Extent,
        tid: u64,
        files: &DataFiles,
        lock: Option<&LockId>,
    ) -> Result<()> {
        let mut mutation = Mutation::new(extent.metadata_row());
        for (path, value) in files.iter() {
            mutation.put(Column::new(DATAFILE_FAMILY, path.as_str()), value.encode());
            mutation.put(Column::new(BULKFILE_FAMILY, path.as_str()), tid.to_string());
        }
        self.writer().update(mutation, lock).await
    }

    /// Bulk imported files of tablet with their transaction ids.
    pub async fn bulk_files_loaded(&self, extent: &Extent) -> Result<BTreeMap<String, u64>> {
        let range = extent.metadata_range().with_families([BULKFILE_FAMILY]);
        let mut files = BTreeMap::new();
        for cell in self.writer().scan(&range).await? {
            files.insert(cell.column.qualifier.to_string(), decimal_value(&cell)?);
        }
        Ok(files)
    }

    pub async fn bulk_files_loaded_by(&self, extent: &Extent, tid: u64) -> Result<BTreeSet<String>> {
        let files = self.bulk_files_loaded(extent).await?;
        Ok(files.into_iter().filter(|(_, loaded)| *loaded == tid).map(|(file, _)| file).collect())
    }

    pub async fn is_bulk_loaded(&self, extent: &Extent, file: &str, tid: u64) -> Result<bool> {
        let files = self.bulk_files_loaded(extent).await?;
        Ok(files.get(file) == Some(&tid))
    }

    /// Removes provenance of bulk transaction `tid` from all tablets of `table`.
    pub async fn remove_bulk_load_entries(&self, table: &str, tid: u64) -> Result<()> {
        let range = ScanRange::new(keys::table_bounds(table)).with_families([BULKFILE_FAMILY]);
        let mut writer = self.batch_writer();
        for cell in self.writer().scan(&range).await? {
            if decimal_value(&cell)? != tid {
                continue;
            }
            let mut mutation = Mutation::new(cell.row);
            mutation.delete(cell.column);
            writer.add(mutation).await?;
        }
        writer.close().await
    }

    /// Flags `path` as target of an ongoing bulk import, so files under it are not collected.
    pub async fn add_bulk_load_in_progress_flag(&self, path: &str) -> Result<()> {
        debug!("flag bulk load in progress for {path}");
        let mut mutation = Mutation::new(keys::bulk_load_flag_row(path));
        mutation.put(FLAG_COLUMN, "");
        self.writer().update(mutation, None).await
    }

    pub async fn remove_bulk_load_in_progress_flag(&self, path: &str) -> Result<()> {
        let mut mutation = Mutation::new(keys::bulk_load_flag_row(path));
        mutation.delete(FLAG_COLUMN);
        self.writer().update(mutation, None).await
    }
}
