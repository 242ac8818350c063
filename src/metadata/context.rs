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

use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;

use super::backend::{CoordinationBackend, StoreBackend, TabletStateBackend};
use super::extent::Extent;
use super::writer::MetadataWriter;
use crate::cluster::{CoordinationLayout, Coordinator};
use crate::fs::FileSystem;
use crate::retry::{RetryPolicy, DEFAULT_RETRY_BACKOFF};
use crate::store::{BatchWriter, BatchWriterConfig, MetadataStore};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataConfig {
    root: CompactString,
    root_tablet_dir: String,
    retry_backoff: Duration,
    batch: BatchWriterConfig,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            root: CompactString::new_inline("/tabletmeta"),
            root_tablet_dir: "/!0/root_tablet".to_string(),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            batch: BatchWriterConfig::default(),
        }
    }
}

impl MetadataConfig {
    /// Root path of this instance in coordination service.
    pub fn with_root(self, root: impl Into<CompactString>) -> Self {
        Self { root: root.into(), ..self }
    }

    /// Directory of root tablet files in filesystem.
    pub fn with_root_tablet_dir(self, dir: impl Into<String>) -> Self {
        Self { root_tablet_dir: dir.into(), ..self }
    }

    pub fn with_retry_backoff(self, backoff: Duration) -> Self {
        Self { retry_backoff: backoff, ..self }
    }

    pub fn with_batch(self, batch: BatchWriterConfig) -> Self {
        Self { batch, ..self }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn root_tablet_dir(&self) -> &str {
        &self.root_tablet_dir
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    pub fn batch(&self) -> &BatchWriterConfig {
        &self.batch
    }
}

/// Handles to everything metadata operations touch, cheap to clone.
#[derive(Clone)]
pub struct MetadataContext {
    config: Arc<MetadataConfig>,
    coordinator: Arc<dyn Coordinator>,
    fs: Arc<dyn FileSystem>,
    writer: MetadataWriter,
    root_backend: Arc<CoordinationBackend>,
    store_backend: Arc<StoreBackend>,
}

impl MetadataContext {
    pub fn new(
        config: MetadataConfig,
        coordinator: Arc<dyn Coordinator>,
        store: Arc<dyn MetadataStore>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let policy = RetryPolicy::default().with_backoff(config.retry_backoff);
        Self::with_policy(config, coordinator, store, fs, policy)
    }

    pub fn with_policy(
        config: MetadataConfig,
        coordinator: Arc<dyn Coordinator>,
        store: Arc<dyn MetadataStore>,
        fs: Arc<dyn FileSystem>,
        policy: RetryPolicy,
    ) -> Self {
        let layout = CoordinationLayout::new(config.root.clone());
        let root_backend = Arc::new(CoordinationBackend::new(
            coordinator.clone(),
            layout,
            fs.clone(),
            config.root_tablet_dir.as_str(),
            policy.clone(),
        ));
        let writer = MetadataWriter::new(store, policy);
        let store_backend = Arc::new(StoreBackend::new(writer.clone()));
        Self { config: Arc::new(config), coordinator, fs, writer, root_backend, store_backend }
    }

    /// Backend holding state of tablet `extent`.
    pub fn backend(&self, extent: &Extent) -> &dyn TabletStateBackend {
        match extent.is_root() {
            true => self.root_backend.as_ref(),
            false => self.store_backend.as_ref(),
        }
    }

    pub fn config(&self) -> &MetadataConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    pub fn layout(&self) -> &CoordinationLayout {
        self.root_backend.layout()
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn writer(&self) -> &MetadataWriter {
        &self.writer
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.writer.policy()
    }

    pub fn root_backend(&self) -> &CoordinationBackend {
        &self.root_backend
    }

    pub fn batch_writer(&self) -> BatchWriter {
        self.writer.batch_writer(self.config.batch.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assertor::*;

    use super::*;
    use crate::cluster::MemoryCoordinator;
    use crate::fs::MemoryFileSystem;
    use crate::store::MemoryMetadataStore;

    /// Context over in memory collaborators with fast retry.
    pub struct TestContext {
        pub context: MetadataContext,
        pub coordinator: Arc<MemoryCoordinator>,
        pub store: Arc<MemoryMetadataStore>,
        pub fs: Arc<MemoryFileSystem>,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self::with_policy(RetryPolicy::default().with_backoff(Duration::from_millis(1)))
        }

        pub fn with_policy(policy: RetryPolicy) -> Self {
            let coordinator = MemoryCoordinator::new();
            let store = MemoryMetadataStore::fenced(coordinator.clone());
            let fs = MemoryFileSystem::new("memory://files".parse().unwrap());
            let config = MetadataConfig::default().with_root("/tm").with_retry_backoff(policy.backoff());
            let context =
                MetadataContext::with_policy(config, coordinator.clone(), store.clone(), fs.clone(), policy);
            Self { context, coordinator, store, fs }
        }
    }

    #[test]
    fn test_config() {
        let config = MetadataConfig::default();
        assert_that!(config.root()).is_equal_to("/tabletmeta");
        assert_that!(config.root_tablet_dir()).is_equal_to("/!0/root_tablet");
        assert_that!(config.retry_backoff()).is_equal_to(Duration::from_secs(1));

        let batch = BatchWriterConfig { max_write_threads: 4, ..Default::default() };
        let config = config.with_root("/tm").with_root_tablet_dir("/!0/root").with_batch(batch.clone());
        assert_that!(config.root()).is_equal_to("/tm");
        assert_that!(config.root_tablet_dir()).is_equal_to("/!0/root");
        assert_that!(config.batch()).is_equal_to(&batch);
    }

    #[tokio::test]
    async fn test_backend_selection() {
        let TestContext { context, coordinator, store, .. } = TestContext::new();
        let lock = coordinator.acquire_lock("/tm/tservers/host:9997");
        let extent = Extent::new("1", None, None).unwrap();
        context.backend(&extent).update_flush_id(&extent, 2, Some(&lock)).await.unwrap();
        assert_that!(store.history()).has_length(1);

        context.backend(&Extent::root()).update_flush_id(&Extent::root(), 2, Some(&lock)).await.unwrap();
        assert_that!(store.history()).has_length(1);
        assert_that!(context.layout().root_tablet_walogs().as_str()).is_equal_to("/tm/root_tablet/walogs");
    }
}
