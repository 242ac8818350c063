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

//! Where state of a tablet lives: coordination service for root tablet, metadata store for all others.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::datafile::{DataFileValue, DataFiles};
use super::extent::Extent;
use super::schema::{
    ServerInstance,
    COMPACT_COLUMN,
    DATAFILE_FAMILY,
    FLUSH_COLUMN,
    LOG_FAMILY,
    SCANFILE_FAMILY,
    TIME_COLUMN,
};
use super::wal::{log_file_name, LogEntry};
use super::writer::MetadataWriter;
use crate::cluster::{CoordinationLayout, Coordinator, LockId};
use crate::error::{MetaError, Result};
use crate::fs::FileSystem;
use crate::retry::RetryPolicy;
use crate::store::{Column, Mutation};

/// File assignment change of a tablet after a minor compaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFileUpdate {
    pub path: String,
    pub value: DataFileValue,
    pub time: String,
    pub address: String,
    pub flush_id: u64,
    pub merge_file: Option<String>,
    pub scan_files: BTreeSet<String>,
    pub unused_logs: Vec<String>,
    pub last_location: Option<ServerInstance>,
}

impl DataFileUpdate {
    pub fn new(
        path: impl Into<String>,
        value: DataFileValue,
        time: impl Into<String>,
        address: impl Into<String>,
        flush_id: u64,
    ) -> Self {
        Self {
            path: path.into(),
            value,
            time: time.into(),
            address: address.into(),
            flush_id,
            merge_file: None,
            scan_files: BTreeSet::new(),
            unused_logs: Vec::new(),
            last_location: None,
        }
    }

    /// File merged into new file, its reference is removed.
    pub fn with_merge_file(self, merge_file: impl Into<String>) -> Self {
        Self { merge_file: Some(merge_file.into()), ..self }
    }

    pub fn with_scan_files(self, scan_files: impl IntoIterator<Item = String>) -> Self {
        Self { scan_files: scan_files.into_iter().collect(), ..self }
    }

    /// Logs, named as `server/file`, no longer needed for recovery.
    pub fn with_unused_logs(self, unused_logs: impl IntoIterator<Item = String>) -> Self {
        Self { unused_logs: unused_logs.into_iter().collect(), ..self }
    }

    pub fn with_last_location(self, last_location: ServerInstance) -> Self {
        Self { last_location: Some(last_location), ..self }
    }
}

/// Tablet state operations that differ between root tablet and other tablets.
#[async_trait]
pub trait TabletStateBackend: Send + Sync {
    async fn update_data_files(&self, extent: &Extent, update: &DataFileUpdate, lock: &LockId) -> Result<()>;

    async fn update_flush_id(&self, extent: &Extent, flush_id: u64, lock: Option<&LockId>) -> Result<()>;

    async fn update_compact_id(&self, extent: &Extent, compact_id: u64, lock: Option<&LockId>) -> Result<()>;

    async fn add_log_entry(&self, entry: &LogEntry, lock: &LockId) -> Result<()>;

    /// Log entries of tablet in ascending timestamp, ties in encounter order.
    async fn log_entries(&self, extent: &Extent) -> Result<Vec<LogEntry>>;

    async fn remove_log_entries(&self, entries: &[LogEntry], lock: &LockId) -> Result<()>;

    async fn file_and_log_entries(&self, extent: &Extent) -> Result<(Vec<LogEntry>, DataFiles)>;
}

/// State of root tablet: write-ahead logs in coordination service, files by listing its directory.
pub struct CoordinationBackend {
    coordinator: Arc<dyn Coordinator>,
    layout: CoordinationLayout,
    fs: Arc<dyn FileSystem>,
    root_tablet_dir: String,
    policy: RetryPolicy,
}

impl CoordinationBackend {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        layout: CoordinationLayout,
        fs: Arc<dyn FileSystem>,
        root_tablet_dir: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self { coordinator, layout, fs, root_tablet_dir: root_tablet_dir.into(), policy }
    }

    pub fn layout(&self) -> &CoordinationLayout {
        &self.layout
    }

    fn check_root(extent: &Extent) -> Result<()> {
        match extent.is_root() {
            true => Ok(()),
            false => Err(MetaError::invalid_argument(format!("{extent} is not root tablet"))),
        }
    }

    /// Deletes node at `path` if `lock` is held, returns whether lock was held.
    async fn delete_if_lock_held(&self, path: &str, lock: &LockId) -> Result<bool> {
        let coordinator = &self.coordinator;
        self.policy
            .run("remove root tablet walog", move || async move {
                if !coordinator.is_lock_held(lock).await? {
                    return Ok(false);
                }
                coordinator.delete_recursive(path).await?;
                Ok(true)
            })
            .await
    }

    async fn delete_if_exists(&self, path: &str) -> Result<bool> {
        let coordinator = &self.coordinator;
        self.policy
            .run("remove unused root tablet walog", move || async move {
                if !coordinator.exists(path).await? {
                    return Ok(false);
                }
                coordinator.delete_recursive(path).await?;
                Ok(true)
            })
            .await
    }

    /// Removes records of unused logs. A log set is recorded under one of its names, so every name is
    /// probed and, failing that, recorded entries are searched for a log set containing any of them.
    async fn remove_unused_logs(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut found = false;
        for name in names {
            let path = self.layout.root_tablet_walog(log_file_name(name));
            found |= self.delete_if_exists(&path).await?;
        }
        if !found {
            for entry in self.list_entries().await? {
                if names.iter().any(|name| entry.covers(name)) {
                    debug!("found root tablet walog entry {} recording log set {:?}", entry.filename, entry.log_set);
                    found |= self.delete_if_exists(&self.layout.root_tablet_walog(&entry.filename)).await?;
                }
            }
        }
        if !found {
            warn!("walog entry for root tablet did not exist: {names:?}");
        }
        Ok(())
    }

    async fn list_entries(&self) -> Result<Vec<LogEntry>> {
        let coordinator = &self.coordinator;
        let layout = &self.layout;
        let mut entries = self
            .policy
            .run("list root tablet walogs", move || async move {
                let mut entries = Vec::new();
                for child in coordinator.children(&layout.root_tablet_walogs()).await? {
                    let Some(bytes) = coordinator.get_data(&layout.root_tablet_walog(&child)).await? else {
                        debug!("root tablet walog {child} vanished after listing");
                        continue;
                    };
                    entries.push(LogEntry::from_bytes(&bytes)?);
                }
                Ok(entries)
            })
            .await?;
        entries.sort_by_key(|entry| entry.timestamp);
        Ok(entries)
    }

    /// Files of root tablet, temporary files excluded.
    pub async fn root_files(&self) -> Result<DataFiles> {
        let fs = &self.fs;
        let dir = self.root_tablet_dir.as_str();
        let statuses = self.policy.run("list root tablet files", move || fs.list(dir)).await?;
        let files = statuses
            .into_iter()
            .filter(|status| !status.name.ends_with("_tmp"))
            .map(|status| (format!("{}/{}", dir, status.name), DataFileValue::new(0, 0)))
            .collect();
        Ok(files)
    }
}

#[async_trait]
impl TabletStateBackend for CoordinationBackend {
    async fn update_data_files(&self, extent: &Extent, update: &DataFileUpdate, _lock: &LockId) -> Result<()> {
        Self::check_root(extent)?;
        self.remove_unused_logs(&update.unused_logs).await
    }

    async fn update_flush_id(&self, _extent: &Extent, _flush_id: u64, _lock: Option<&LockId>) -> Result<()> {
        Ok(())
    }

    async fn update_compact_id(&self, _extent: &Extent, _compact_id: u64, _lock: Option<&LockId>) -> Result<()> {
        Ok(())
    }

    async fn add_log_entry(&self, entry: &LogEntry, lock: &LockId) -> Result<()> {
        Self::check_root(&entry.extent)?;
        let bytes = entry.to_bytes()?;
        let path = self.layout.root_tablet_walog(&entry.filename);
        let coordinator = &self.coordinator;
        let (path, bytes) = (path.as_str(), bytes.as_slice());
        let recorded = self
            .policy
            .run("record root tablet walog", move || async move {
                if !coordinator.is_lock_held(lock).await? {
                    return Ok(false);
                }
                coordinator.put_persistent(path, bytes).await?;
                Ok(true)
            })
            .await?;
        if !recorded {
            info!("skip recording root tablet walog {} as lock {lock} is lost", entry.filename);
        }
        Ok(())
    }

    async fn log_entries(&self, extent: &Extent) -> Result<Vec<LogEntry>> {
        Self::check_root(extent)?;
        self.list_entries().await
    }

    async fn remove_log_entries(&self, entries: &[LogEntry], lock: &LockId) -> Result<()> {
        for entry in entries {
            let path = self.layout.root_tablet_walog(&entry.filename);
            if !self.delete_if_lock_held(&path, lock).await? {
                info!("skip removing root tablet walog {} as lock {lock} is lost", entry.filename);
            }
        }
        Ok(())
    }

    async fn file_and_log_entries(&self, extent: &Extent) -> Result<(Vec<LogEntry>, DataFiles)> {
        Self::check_root(extent)?;
        let entries = self.list_entries().await?;
        let files = self.root_files().await?;
        Ok((entries, files))
    }
}

/// State of tablets other than root tablet, in their rows in metadata store.
pub struct StoreBackend {
    writer: MetadataWriter,
}

impl StoreBackend {
    pub fn new(writer: MetadataWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl TabletStateBackend for StoreBackend {
    async fn update_data_files(&self, extent: &Extent, update: &DataFileUpdate, lock: &LockId) -> Result<()> {
        let mut mutation = Mutation::new(extent.metadata_row());
        if update.value.entries() > 0 {
            mutation.put(Column::new(DATAFILE_FAMILY, update.path.as_str()), update.value.encode());
            mutation.put(TIME_COLUMN, update.time.as_str());
            let server = ServerInstance::from_lock(update.address.as_str(), lock);
            server.put_last_location(&mut mutation);
            if let Some(last) = update.last_location.as_ref().filter(|last| **last != server) {
                last.clear_last_location(&mut mutation);
            }
        }
        for name in update.unused_logs.iter() {
            mutation.delete(Column::new(LOG_FAMILY, name.as_str()));
        }
        for file in update.scan_files.iter() {
            mutation.put(Column::new(SCANFILE_FAMILY, file.as_str()), "");
        }
        if let Some(merge_file) = update.merge_file.as_ref() {
            mutation.delete(Column::new(DATAFILE_FAMILY, merge_file.as_str()));
        }
        mutation.put(FLUSH_COLUMN, update.flush_id.to_string());
        self.writer.update(mutation, Some(lock)).await
    }

    async fn update_flush_id(&self, extent: &Extent, flush_id: u64, lock: Option<&LockId>) -> Result<()> {
        let mut mutation = Mutation::new(extent.metadata_row());
        mutation.put(FLUSH_COLUMN, flush_id.to_string());
        self.writer.update(mutation, lock).await
    }

    async fn update_compact_id(&self, extent: &Extent, compact_id: u64, lock: Option<&LockId>) -> Result<()> {
        let mut mutation = Mutation::new(extent.metadata_row());
        mutation.put(COMPACT_COLUMN, compact_id.to_string());
        self.writer.update(mutation, lock).await
    }

    async fn add_log_entry(&self, entry: &LogEntry, lock: &LockId) -> Result<()> {
        let mut mutation = Mutation::new(entry.extent.metadata_row());
        mutation.put_at(entry.column(), entry.to_value(), entry.timestamp);
        self.writer.update(mutation, Some(lock)).await
    }

    async fn log_entries(&self, extent: &Extent) -> Result<Vec<LogEntry>> {
        let range = extent.metadata_range().with_families([LOG_FAMILY]);
        let cells = self.writer.scan(&range).await?;
        let mut entries = cells.iter().map(|cell| LogEntry::from_cell(extent, cell)).collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.timestamp);
        Ok(entries)
    }

    async fn remove_log_entries(&self, entries: &[LogEntry], lock: &LockId) -> Result<()> {
        for entry in entries {
            let mut mutation = Mutation::new(entry.extent.metadata_row());
            mutation.delete(entry.column());
            self.writer.update(mutation, Some(lock)).await?;
        }
        Ok(())
    }

    async fn file_and_log_entries(&self, extent: &Extent) -> Result<(Vec<LogEntry>, DataFiles)> {
        let range = extent.metadata_range().with_families([LOG_FAMILY, DATAFILE_FAMILY]);
        let mut entries = Vec::new();
        let mut files = DataFiles::new();
        for cell in self.writer.scan(&range).await? {
            match cell.column.family.as_str() {
                LOG_FAMILY => entries.push(LogEntry::from_cell(extent, &cell)?),
                _ => {
                    files.insert(cell.column.qualifier.to_string(), DataFileValue::decode(&cell.value)?);
                },
            }
        }
        entries.sort_by_key(|entry| entry.timestamp);
        Ok((entries, files))
    }
}
