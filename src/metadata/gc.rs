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

//! Tombstones of data files and their reconciliation against live references.

use std::collections::BTreeSet;
use std::ops::Bound;

use tracing::{debug, info};

use super::context::MetadataContext;
use super::extent::Extent;
use super::schema::{utf8_value, DATAFILE_FAMILY, DIRECTORY_COLUMN, FLAG_COLUMN};
use crate::error::{MetaError, Result};
use crate::keys::{self, BULK_LOAD_FLAG_PREFIX, DELETE_FLAG_PREFIX, METADATA_DELETE_FLAG_PREFIX, METADATA_TABLE_ID};
use crate::store::{Cell, Mutation, ScanRange};

/// Tombstone for file or directory `path` of `table`.
pub fn delete_marker(table: &str, path: &str) -> Mutation {
    let mut mutation = Mutation::new(keys::delete_flag_row(table, path));
    mutation.put(FLAG_COLUMN, "");
    mutation
}

fn marker_path<'a>(row: &'a [u8], prefix: &str) -> Result<&'a str> {
    row.strip_prefix(prefix.as_bytes())
        .and_then(|path| std::str::from_utf8(path).ok())
        .ok_or_else(|| MetaError::corrupted(format!("malformed delete marker {:?}", String::from_utf8_lossy(row))))
}

impl MetadataContext {
    pub async fn add_delete_entry(&self, table: &str, path: &str) -> Result<()> {
        self.writer().update(delete_marker(table, path), None).await
    }

    /// Writes tombstones for files of tablet `extent`, all durable once this returns.
    pub async fn add_delete_entries<'a>(
        &self,
        extent: &Extent,
        files: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let mut writer = self.batch_writer();
        for file in files {
            writer.add(delete_marker(extent.table(), file)).await?;
        }
        writer.close().await
    }

    /// Moves tombstones of metadata table files out of user namespace, returns number of moved tombstones.
    ///
    /// New tombstone is written before old one is deleted, so a crash leaves at worst a duplicate.
    pub async fn move_meta_delete_markers(&self) -> Result<usize> {
        let prefix = format!("{DELETE_FLAG_PREFIX}/{METADATA_TABLE_ID}/");
        let range = ScanRange::new(keys::prefix_bounds(prefix.as_bytes()));
        let rows = self.writer().scan_rows(&range).await?;
        for row in rows.iter() {
            let path = marker_path(&row.row, DELETE_FLAG_PREFIX)?;
            let mut mutation = Mutation::new(format!("{METADATA_DELETE_FLAG_PREFIX}{path}"));
            mutation.put(FLAG_COLUMN, "");
            self.writer().update(mutation, None).await?;
            let mut mutation = Mutation::new(row.row.clone());
            mutation.delete(FLAG_COLUMN);
            self.writer().update(mutation, None).await?;
            debug!("moved delete marker {path} to metadata namespace");
        }
        Ok(rows.len())
    }
}

/// Namespace of tombstones, one for files of the metadata table and one for all others.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerNamespace {
    Metadata,
    User,
}

impl MarkerNamespace {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Metadata => METADATA_DELETE_FLAG_PREFIX,
            Self::User => DELETE_FLAG_PREFIX,
        }
    }

    fn contains_table(self, table: &str) -> bool {
        (table == METADATA_TABLE_ID) == (self == Self::Metadata)
    }
}

/// Deletes files whose tombstones are no longer contradicted by any reference, then their tombstones.
pub struct DeleteMarkerCollector {
    context: MetadataContext,
}

impl DeleteMarkerCollector {
    pub fn new(context: MetadataContext) -> Self {
        Self { context }
    }

    /// Filesystem paths of files and directories referenced by tablets of tables in `namespace`.
    async fn referenced_paths(&self, namespace: MarkerNamespace) -> Result<BTreeSet<String>> {
        let mut paths = BTreeSet::new();
        let range = ScanRange::new((Bound::Unbounded, Bound::Unbounded))
            .with_families([DATAFILE_FAMILY, DIRECTORY_COLUMN.family.as_str()]);
        for cell in self.context.writer().scan(&range).await? {
            if cell.row.starts_with(b"~") || cell.row.starts_with(b"!!") {
                continue;
            }
            let (table, _) = keys::decode_tablet_row(&cell.row)?;
            if !namespace.contains_table(table) {
                continue;
            }
            if let Some(path) = referenced_path(table, &cell)? {
                paths.insert(path);
            }
        }
        if namespace == MarkerNamespace::Metadata {
            paths.insert(self.context.config().root_tablet_dir().to_string());
            paths.extend(self.context.root_backend().root_files().await?.into_keys());
        }
        Ok(paths)
    }

    async fn bulk_loading_paths(&self) -> Result<Vec<String>> {
        let range = ScanRange::new(keys::prefix_bounds(BULK_LOAD_FLAG_PREFIX.as_bytes()));
        let rows = self.context.writer().scan_rows(&range).await?;
        rows.iter().map(|row| marker_path(&row.row, BULK_LOAD_FLAG_PREFIX).map(ToString::to_string)).collect()
    }

    /// Collects garbage in `namespace`, returns number of deleted tombstones.
    pub async fn collect(&self, namespace: MarkerNamespace) -> Result<usize> {
        let prefix = namespace.prefix();
        let range = ScanRange::new(keys::prefix_bounds(prefix.as_bytes()));
        let markers = self.context.writer().scan_rows(&range).await?;
        if markers.is_empty() {
            return Ok(0);
        }
        let referenced = self.referenced_paths(namespace).await?;
        let bulk_loading = self.bulk_loading_paths().await?;
        let mut collected = 0;
        for marker in markers.iter() {
            let path = marker_path(&marker.row, prefix)?;
            if is_in_use(&referenced, path) {
                debug!("skip delete marker {path} as it is still referenced");
                continue;
            }
            if bulk_loading.iter().any(|loading| path == loading || path.starts_with(&format!("{loading}/"))) {
                debug!("skip delete marker {path} as it is under bulk loading");
                continue;
            }
            let fs = self.context.fs();
            let existed = self.context.policy().run("delete garbage file", move || fs.delete(path)).await?;
            let mut mutation = Mutation::new(marker.row.clone());
            mutation.delete(FLAG_COLUMN);
            self.context.writer().update(mutation, None).await?;
            info!("collected garbage {path}, existed: {existed}");
            collected += 1;
        }
        Ok(collected)
    }
}

fn referenced_path(table: &str, cell: &Cell) -> Result<Option<String>> {
    if cell.column.family == DATAFILE_FAMILY {
        let file = cell.column.qualifier.as_str();
        let path = match file.strip_prefix("..") {
            Some(relative) if file.starts_with("../") => relative.to_string(),
            _ => format!("/{table}{file}"),
        };
        return Ok(Some(path));
    }
    if cell.column == DIRECTORY_COLUMN {
        return Ok(Some(format!("/{table}{}", utf8_value(cell)?)));
    }
    Ok(None)
}

/// Whether `path` or anything under it is referenced.
fn is_in_use(referenced: &BTreeSet<String>, path: &str) -> bool {
    if referenced.contains(path) {
        return true;
    }
    let dir = format!("{path}/");
    referenced.range(dir.clone()..).next().is_some_and(|referenced| referenced.starts_with(&dir))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assertor::*;

    use super::*;
    use crate::metadata::context::tests::TestContext;
    use crate::metadata::datafile::{DataFileValue, DataFiles};
    use crate::metadata::tablet::{NewTablet, ReplaceDatafiles};
    use crate::retry::RetryPolicy;
    use crate::store::MetadataStore;

    fn marker_rows(rows: Vec<Vec<u8>>, prefix: &str) -> Vec<String> {
        rows.into_iter()
            .filter(|row| row.starts_with(prefix.as_bytes()))
            .map(|row| String::from_utf8(row).unwrap())
            .collect()
    }

    #[test]
    fn test_delete_marker() {
        let mutation = delete_marker("1", "/t-0001/F1.rf");
        assert_that!(mutation.row()).is_equal_to(b"~del/1/t-0001/F1.rf".as_slice());
        assert_that!(mutation.value_of(&FLAG_COLUMN)).is_equal_to(Some(b"".as_slice()));

        let mutation = delete_marker("1", "../2/t-0002/F2.rf");
        assert_that!(mutation.row()).is_equal_to(b"~del/2/t-0002/F2.rf".as_slice());

        let mutation = delete_marker(METADATA_TABLE_ID, "/t-0003/F3.rf");
        assert_that!(mutation.row()).is_equal_to(b"!!~del/!0/t-0003/F3.rf".as_slice());
    }

    #[tokio::test]
    async fn test_tombstones_survive_crash_before_removal() {
        let policy =
            RetryPolicy::default().with_backoff(Duration::from_millis(1)).with_deadline(Duration::from_millis(20));
        let TestContext { context, coordinator, store, .. } = TestContext::with_policy(policy);
        let lock = coordinator.acquire_lock("/tm/tservers/host:9997");
        let extent = Extent::new("1", None, None).unwrap();
        let files: DataFiles = [
            ("/t-0001/F1.rf".to_string(), DataFileValue::new(10, 1)),
            ("/t-0001/F2.rf".to_string(), DataFileValue::new(20, 2)),
        ]
        .into();
        let tablet = NewTablet::new(extent.clone(), "/t-0001", "M0").with_files(files.clone());
        context.add_new_tablet(&tablet, None).await.unwrap();

        let replace = ReplaceDatafiles::new(
            extent.clone(),
            files.keys().cloned(),
            "/t-0001/A3.rf",
            DataFileValue::new(30, 3),
            "host:9997",
        );
        store.crash_after(1);
        let err = context.replace_datafiles(&replace, &lock).await.unwrap_err();
        assert!(matches!(err, MetaError::DeadlineExceeded { .. }));
        store.recover();

        assert_that!(context.data_file_sizes(&extent).await.unwrap()).is_equal_to(files);
        assert_that!(marker_rows(store.rows(), DELETE_FLAG_PREFIX)).has_length(1);

        context.replace_datafiles(&replace, &lock).await.unwrap();
        assert_that!(marker_rows(store.rows(), DELETE_FLAG_PREFIX)).has_length(2);
        assert_that!(context.data_file_sizes(&extent).await.unwrap().keys().cloned().collect::<Vec<_>>())
            .is_equal_to(vec!["/t-0001/A3.rf".to_string()]);
    }

    #[tokio::test]
    async fn test_move_meta_delete_markers() {
        let TestContext { context, store, .. } = TestContext::new();
        let mut mutation = Mutation::new("~del/!0/t-0001/F1.rf");
        mutation.put(FLAG_COLUMN, "");
        store.apply(&mutation).await.unwrap();
        context.add_delete_entry("1", "/t-0002/F2.rf").await.unwrap();

        assert_that!(context.move_meta_delete_markers().await.unwrap()).is_equal_to(1);
        assert_that!(marker_rows(store.rows(), "!!~del")).is_equal_to(vec!["!!~del/!0/t-0001/F1.rf".to_string()]);
        assert_that!(marker_rows(store.rows(), "~del")).is_equal_to(vec!["~del/1/t-0002/F2.rf".to_string()]);

        let history = store.history();
        let rows: Vec<&[u8]> = history[2..].iter().map(|mutation| mutation.row()).collect();
        assert_that!(rows).is_equal_to(vec![b"!!~del/!0/t-0001/F1.rf".as_slice(), b"~del/!0/t-0001/F1.rf".as_slice()]);
        assert_that!(context.move_meta_delete_markers().await.unwrap()).is_equal_to(0);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn test_collector_keeps_referenced_files() {
        let TestContext { context, fs, store, .. } = TestContext::new();
        let files: DataFiles = [("/t-0001/F1.rf".to_string(), DataFileValue::new(10, 1))].into();
        let source = NewTablet::new(Extent::new("1", None, None).unwrap(), "/t-0001", "M0").with_files(files);
        context.add_new_tablet(&source, None).await.unwrap();
        let files: DataFiles = [("../1/t-0001/F2.rf".to_string(), DataFileValue::new(10, 1))].into();
        let clone = NewTablet::new(Extent::new("2", None, None).unwrap(), "/c-00000000", "M0").with_files(files);
        context.add_new_tablet(&clone, None).await.unwrap();
        context.add_bulk_load_in_progress_flag("/1/b-0001").await.unwrap();

        for file in ["/1/t-0001/F1.rf", "/1/t-0001/F2.rf", "/1/t-0001/F3.rf", "/1/b-0001/I1.rf", "/3/t-0009/F9.rf"] {
            fs.put(file, "data");
        }
        let extent = Extent::new("1", None, None).unwrap();
        let garbage = ["/t-0001/F1.rf", "/t-0001/F2.rf", "/t-0001/F3.rf", "/t-0001"];
        context.add_delete_entries(&extent, garbage).await.unwrap();
        context.add_delete_entry("1", "/b-0001/I1.rf").await.unwrap();
        context.add_delete_entry("3", "/t-0009").await.unwrap();

        let collector = DeleteMarkerCollector::new(context.clone());
        assert_that!(collector.collect(MarkerNamespace::User).await.unwrap()).is_equal_to(2);
        assert_that!(fs.files()).is_equal_to(vec![
            "/1/b-0001/I1.rf".to_string(),
            "/1/t-0001/F1.rf".to_string(),
            "/1/t-0001/F2.rf".to_string(),
        ]);
        assert_that!(marker_rows(store.rows(), DELETE_FLAG_PREFIX)).is_equal_to(vec![
            "~del/1/b-0001/I1.rf".to_string(),
            "~del/1/t-0001".to_string(),
            "~del/1/t-0001/F1.rf".to_string(),
            "~del/1/t-0001/F2.rf".to_string(),
        ]);
        assert!(logs_contain("skip delete marker /1/t-0001 as it is still referenced"));
        assert!(logs_contain("skip delete marker /1/b-0001/I1.rf as it is under bulk loading"));
    }

    #[tokio::test]
    async fn test_collector_metadata_namespace() {
        let TestContext { context, fs, store, .. } = TestContext::new();
        let files: DataFiles = [("/t-0001/F0002.rf".to_string(), DataFileValue::new(10, 1))].into();
        let extent = Extent::new(METADATA_TABLE_ID, None, None).unwrap();
        context.add_new_tablet(&NewTablet::new(extent, "/t-0001", "M0").with_files(files), None).await.unwrap();
        fs.put("/!0/root_tablet/F0001.rf", "data");
        fs.put("/!0/t-0001/F0002.rf", "data");
        fs.put("/!0/t-0002/F0003.rf", "data");
        let root = Extent::root();
        let garbage = ["/root_tablet/F0001.rf", "/t-0001/F0002.rf", "/t-0002/F0003.rf"];
        context.add_delete_entries(&root, garbage).await.unwrap();
        context.add_delete_entry("1", "/t-0001/F0002.rf").await.unwrap();

        let collector = DeleteMarkerCollector::new(context);
        assert_that!(collector.collect(MarkerNamespace::Metadata).await.unwrap()).is_equal_to(1);
        let files = vec!["/!0/root_tablet/F0001.rf".to_string(), "/!0/t-0001/F0002.rf".to_string()];
        assert_that!(fs.files()).is_equal_to(files);
        let markers = vec!["~del/1/t-0001/F0002.rf".to_string()];
        assert_that!(marker_rows(store.rows(), DELETE_FLAG_PREFIX)).is_equal_to(markers);
    }
}
