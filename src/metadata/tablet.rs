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

//! Lifecycle operations on tablet rows.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{error, info};

use super::backend::DataFileUpdate;
use super::context::MetadataContext;
use super::datafile::{DataFileValue, DataFiles};
use super::extent::Extent;
use super::gc::delete_marker;
use super::schema::{
    utf8_value,
    ServerInstance,
    TabletMetadata,
    BULKFILE_FAMILY,
    CHOPPED_COLUMN,
    COMPACT_COLUMN,
    DATAFILE_FAMILY,
    DIRECTORY_COLUMN,
    FLUSH_COLUMN,
    PREV_ROW_COLUMN,
    SCANFILE_FAMILY,
    TIME_COLUMN,
};
use super::wal::LogEntry;
use super::writer::put_lock;
use crate::cluster::LockId;
use crate::error::{MetaError, Result};
use crate::keys;
use crate::store::{Column, Mutation, ScanRange};

/// Tablet created by a split or a table creation, with its initial state.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTablet {
    pub extent: Extent,
    pub dir: String,
    pub time: String,
    pub location: Option<ServerInstance>,
    pub files: DataFiles,
    pub bulk_loaded: BTreeMap<String, u64>,
    pub flush_id: u64,
    pub compact_id: u64,
}

impl NewTablet {
    pub fn new(extent: Extent, dir: impl Into<String>, time: impl Into<String>) -> Self {
        Self {
            extent,
            dir: dir.into(),
            time: time.into(),
            location: None,
            files: DataFiles::new(),
            bulk_loaded: BTreeMap::new(),
            flush_id: 0,
            compact_id: 0,
        }
    }

    /// Server the tablet is assigned to right away, replacing its future location.
    pub fn with_location(self, location: ServerInstance) -> Self {
        Self { location: Some(location), ..self }
    }

    pub fn with_files(self, files: DataFiles) -> Self {
        Self { files, ..self }
    }

    pub fn with_bulk_loaded(self, bulk_loaded: BTreeMap<String, u64>) -> Self {
        Self { bulk_loaded, ..self }
    }

    pub fn with_flush_id(self, flush_id: u64) -> Self {
        Self { flush_id, ..self }
    }

    pub fn with_compact_id(self, compact_id: u64) -> Self {
        Self { compact_id, ..self }
    }
}

/// Outcome of a major compaction: files replaced by at most one new file.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplaceDatafiles {
    pub extent: Extent,
    pub to_remove: BTreeSet<String>,
    pub scan_files: BTreeSet<String>,
    pub new_file: String,
    pub value: DataFileValue,
    pub compaction_id: Option<u64>,
    pub address: String,
    pub last_location: Option<ServerInstance>,
    /// Whether removed files get tombstones, written before their references are gone.
    pub insert_delete_flags: bool,
}

impl ReplaceDatafiles {
    pub fn new(
        extent: Extent,
        to_remove: impl IntoIterator<Item = String>,
        new_file: impl Into<String>,
        value: DataFileValue,
        address: impl Into<String>,
    ) -> Self {
        Self {
            extent,
            to_remove: to_remove.into_iter().collect(),
            scan_files: BTreeSet::new(),
            new_file: new_file.into(),
            value,
            compaction_id: None,
            address: address.into(),
            last_location: None,
            insert_delete_flags: true,
        }
    }

    pub fn with_scan_files(self, scan_files: impl IntoIterator<Item = String>) -> Self {
        Self { scan_files: scan_files.into_iter().collect(), ..self }
    }

    pub fn with_compaction_id(self, compaction_id: u64) -> Self {
        Self { compaction_id: Some(compaction_id), ..self }
    }

    pub fn with_last_location(self, last_location: ServerInstance) -> Self {
        Self { last_location: Some(last_location), ..self }
    }

    pub fn with_delete_flags(self, insert_delete_flags: bool) -> Self {
        Self { insert_delete_flags, ..self }
    }
}

impl MetadataContext {
    /// Creates row of an empty tablet with logical time of `time_type` starting at zero.
    pub async fn add_tablet(&self, extent: &Extent, dir: &str, time_type: char, lock: Option<&LockId>) -> Result<()> {
        let mut mutation = extent.prev_row_mutation();
        mutation.put(DIRECTORY_COLUMN, dir);
        mutation.put(TIME_COLUMN, format!("{time_type}0"));
        self.writer().update(mutation, lock).await
    }

    pub async fn add_new_tablet(&self, tablet: &NewTablet, lock: Option<&LockId>) -> Result<()> {
        let mut mutation = tablet.extent.prev_row_mutation();
        mutation.put(DIRECTORY_COLUMN, tablet.dir.as_str());
        mutation.put(TIME_COLUMN, tablet.time.as_str());
        if tablet.flush_id > 0 {
            mutation.put(FLUSH_COLUMN, tablet.flush_id.to_string());
        }
        if tablet.compact_id > 0 {
            mutation.put(COMPACT_COLUMN, tablet.compact_id.to_string());
        }
        if let Some(location) = tablet.location.as_ref() {
            location.put_location(&mut mutation);
            location.clear_future_location(&mut mutation);
        }
        for (path, value) in tablet.files.iter() {
            mutation.put(Column::new(DATAFILE_FAMILY, path.as_str()), value.encode());
        }
        for (path, tid) in tablet.bulk_loaded.iter() {
            mutation.put(Column::new(BULKFILE_FAMILY, path.as_str()), tid.to_string());
        }
        self.writer().update(mutation, lock).await
    }

    /// Rewrites prev row of tablet, as after a merge.
    pub async fn update_tablet_prev_end_row(&self, extent: &Extent, lock: Option<&LockId>) -> Result<()> {
        self.writer().update(extent.prev_row_mutation(), lock).await
    }

    pub async fn update_data_files(&self, extent: &Extent, update: &DataFileUpdate, lock: &LockId) -> Result<()> {
        self.backend(extent).update_data_files(extent, update, lock).await
    }

    pub async fn update_flush_id(&self, extent: &Extent, flush_id: u64, lock: Option<&LockId>) -> Result<()> {
        self.backend(extent).update_flush_id(extent, flush_id, lock).await
    }

    pub async fn update_compact_id(&self, extent: &Extent, compact_id: u64, lock: Option<&LockId>) -> Result<()> {
        self.backend(extent).update_compact_id(extent, compact_id, lock).await
    }

    /// Marks tablet as having no data outside its range.
    pub async fn chopped(&self, extent: &Extent, lock: Option<&LockId>) -> Result<()> {
        let mut mutation = Mutation::new(extent.metadata_row());
        mutation.put(CHOPPED_COLUMN, "chopped");
        self.writer().update(mutation, lock).await
    }

    pub async fn remove_scan_files(
        &self,
        extent: &Extent,
        scan_files: &BTreeSet<String>,
        lock: Option<&LockId>,
    ) -> Result<()> {
        let mut mutation = Mutation::new(extent.metadata_row());
        for file in scan_files.iter() {
            mutation.delete(Column::new(SCANFILE_FAMILY, file.as_str()));
        }
        self.writer().update(mutation, lock).await
    }

    /// Replaces compacted files. Tombstones, if requested, are durable before any reference is dropped.
    pub async fn replace_datafiles(&self, replace: &ReplaceDatafiles, lock: &LockId) -> Result<()> {
        let extent = &replace.extent;
        if replace.insert_delete_flags {
            self.add_delete_entries(extent, replace.to_remove.iter().map(String::as_str)).await?;
        }
        let mut mutation = Mutation::new(extent.metadata_row());
        for file in replace.to_remove.iter() {
            mutation.delete(Column::new(DATAFILE_FAMILY, file.as_str()));
        }
        for file in replace.scan_files.iter() {
            mutation.put(Column::new(SCANFILE_FAMILY, file.as_str()), "");
        }
        if replace.value.entries() > 0 {
            mutation.put(Column::new(DATAFILE_FAMILY, replace.new_file.as_str()), replace.value.encode());
        }
        if let Some(compaction_id) = replace.compaction_id {
            mutation.put(COMPACT_COLUMN, compaction_id.to_string());
        }
        let server = ServerInstance::from_lock(replace.address.as_str(), lock);
        server.put_last_location(&mut mutation);
        if let Some(last) = replace.last_location.as_ref().filter(|last| **last != server) {
            last.clear_last_location(&mut mutation);
        }
        self.writer().update(mutation, Some(lock)).await
    }

    /// Data files of tablet with their estimates.
    pub async fn data_file_sizes(&self, extent: &Extent) -> Result<DataFiles> {
        if extent.is_root() {
            return self.root_backend().root_files().await;
        }
        let range = extent.metadata_range().with_families([DATAFILE_FAMILY]);
        let mut files = DataFiles::new();
        for cell in self.writer().scan(&range).await? {
            files.insert(cell.column.qualifier.to_string(), DataFileValue::decode(&cell.value)?);
        }
        Ok(files)
    }

    /// Directories of all tablets of `table`.
    pub async fn directory_entries(&self, table: &str) -> Result<BTreeMap<Extent, String>> {
        let mut directories = BTreeMap::new();
        for tablet in self.scan_tablets(table).await? {
            if let (Some(extent), Some(dir)) = (tablet.extent, tablet.dir) {
                directories.insert(extent, dir);
            }
        }
        Ok(directories)
    }

    pub async fn file_and_log_entries(&self, extent: &Extent) -> Result<(Vec<LogEntry>, DataFiles)> {
        self.backend(extent).file_and_log_entries(extent).await
    }

    pub async fn add_log_entry(&self, entry: &LogEntry, lock: &LockId) -> Result<()> {
        self.backend(&entry.extent).add_log_entry(entry, lock).await
    }

    pub async fn log_entries(&self, extent: &Extent) -> Result<Vec<LogEntry>> {
        self.backend(extent).log_entries(extent).await
    }

    /// Removes log entries no longer needed by tablet `extent`.
    pub async fn remove_log_entries(&self, extent: &Extent, entries: &[LogEntry], lock: &LockId) -> Result<()> {
        self.backend(extent).remove_log_entries(entries, lock).await
    }

    /// Publishes serving address of root tablet, returns false after three failed attempts.
    pub async fn record_root_tablet_location(&self, address: &str) -> bool {
        let path = self.layout().root_tablet_location();
        for attempt in 1..=3 {
            info!("trying to record root tablet location {address} in attempt {attempt}");
            match self.coordinator().put_persistent(&path, address.as_bytes()).await {
                Ok(()) => {
                    info!("recorded root tablet location {address}");
                    return true;
                },
                Err(err) => error!("fail to record root tablet location {address} in attempt {attempt}: {err}"),
            }
            tokio::time::sleep(self.policy().backoff()).await;
        }
        error!("give up recording root tablet location {address} after 3 attempts");
        false
    }

    pub async fn root_tablet_location(&self) -> Result<Option<String>> {
        let coordinator = self.coordinator();
        let path = self.layout().root_tablet_location();
        let path = path.as_str();
        let data = self.policy().run("read root tablet location", move || coordinator.get_data(path)).await?;
        let Some(data) = data else {
            return Ok(None);
        };
        match String::from_utf8(data) {
            Ok(address) => Ok(Some(address)),
            Err(_) => Err(MetaError::corrupted("root tablet location is not utf8")),
        }
    }

    /// Deletes all tablet rows of `table`, tombstoning their files and directories first if requested.
    pub async fn delete_table(&self, table: &str, insert_deletes: bool, lock: Option<&LockId>) -> Result<()> {
        let range = ScanRange::new(keys::table_bounds(table));
        let rows = self.writer().scan_rows(&range).await?;
        let mut writer = self.batch_writer();
        if insert_deletes {
            for row in rows.iter() {
                for cell in row.cells.iter() {
                    if cell.column.family == DATAFILE_FAMILY {
                        let path = cell.column.qualifier.as_str();
                        if !path.starts_with("../") {
                            writer.add(delete_marker(table, path)).await?;
                        }
                    } else if cell.column == DIRECTORY_COLUMN {
                        writer.add(delete_marker(table, utf8_value(cell)?)).await?;
                    }
                }
            }
            writer.flush().await?;
        }
        for row in rows.iter() {
            let mut mutation = Mutation::new(row.row.clone());
            if let Some(lock) = lock {
                put_lock(&mut mutation, lock);
            }
            for cell in row.cells.iter() {
                mutation.delete(cell.column.clone());
            }
            writer.add(mutation).await?;
        }
        info!("deleted {} tablets of table {table}", rows.len());
        writer.close().await
    }

    /// Tablets of `table` in row order.
    pub async fn scan_tablets(&self, table: &str) -> Result<Vec<TabletMetadata>> {
        let range = ScanRange::new(keys::table_bounds(table));
        let rows = self.writer().scan_rows(&range).await?;
        rows.iter().filter(|row| row.get(&PREV_ROW_COLUMN).is_some()).map(TabletMetadata::from_row).collect()
    }
}
