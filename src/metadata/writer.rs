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

use crate::cluster::LockId;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::store::{BatchWriter, BatchWriterConfig, Cell, MetadataStore, Mutation, RowCells, ScanRange, LOCK_COLUMN};

/// Attaches lock identity so store rejects mutation once its writer lost the lock.
pub fn put_lock(mutation: &mut Mutation, lock: &LockId) {
    mutation.put(LOCK_COLUMN, lock.to_string());
}

/// Fenced and retried access to metadata store.
#[derive(Clone)]
pub struct MetadataWriter {
    store: Arc<dyn MetadataStore>,
    policy: RetryPolicy,
}

impl MetadataWriter {
    pub fn new(store: Arc<dyn MetadataStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Applies mutation under given lock, retrying as [RetryPolicy] classifies failures.
    pub async fn update(&self, mut mutation: Mutation, lock: Option<&LockId>) -> Result<()> {
        if let Some(lock) = lock {
            put_lock(&mut mutation, lock);
        }
        let store = &self.store;
        let mutation = &mutation;
        self.policy.run("metadata update", move || store.apply(mutation)).await
    }

    pub async fn scan(&self, range: &ScanRange) -> Result<Vec<Cell>> {
        let store = &self.store;
        self.policy.run("metadata scan", move || store.scan(range)).await
    }

    pub async fn scan_rows(&self, range: &ScanRange) -> Result<Vec<RowCells>> {
        let cells = self.scan(range).await?;
        Ok(crate::store::group_rows(cells))
    }

    pub fn batch_writer(&self, config: BatchWriterConfig) -> BatchWriter {
        BatchWriter::new(self.store.clone(), config, self.policy.clone())
    }
}
