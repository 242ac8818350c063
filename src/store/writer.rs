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

use bytesize::ByteSize;
use futures::stream::{self, StreamExt};
use hashlink::LinkedHashMap;
use tokio::time::Instant;
use tracing::debug;

use super::{MetadataStore, Mutation};
use crate::error::{MetaError, Result};
use crate::retry::RetryPolicy;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchWriterConfig {
    /// Buffered mutation bytes that trigger a flush.
    pub max_memory: ByteSize,
    /// Age of oldest buffered mutation that triggers a flush.
    pub max_latency: Duration,
    /// Rows written concurrently during a flush.
    pub max_write_threads: usize,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self { max_memory: ByteSize::b(1_000_000), max_latency: Duration::from_secs(120), max_write_threads: 2 }
    }
}

/// Buffers independent row mutations and writes them concurrently.
///
/// Mutations to the same row are applied in the order they were added. Nothing is ordered across rows
/// except by [BatchWriter::flush].
pub struct BatchWriter {
    store: Arc<dyn MetadataStore>,
    config: BatchWriterConfig,
    policy: RetryPolicy,
    pending: LinkedHashMap<Vec<u8>, Vec<Mutation>>,
    memory: u64,
    oldest: Option<Instant>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn MetadataStore>, config: BatchWriterConfig, policy: RetryPolicy) -> Self {
        Self { store, config, policy, pending: LinkedHashMap::new(), memory: 0, oldest: None }
    }

    pub async fn add(&mut self, mutation: Mutation) -> Result<()> {
        if mutation.is_empty() {
            return Ok(());
        }
        self.memory += mutation.estimated_size() as u64;
        self.oldest.get_or_insert_with(Instant::now);
        self.pending.entry(mutation.row().to_vec()).or_insert_with(Default::default).push(mutation);
        if self.memory >= self.config.max_memory.as_u64()
            || self.oldest.is_some_and(|oldest| oldest.elapsed() >= self.config.max_latency)
        {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes all buffered mutations, returns first failure if any.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.pending);
        debug!("flushing {} rows of {} bytes", rows.len(), self.memory);
        self.memory = 0;
        self.oldest = None;
        let store = &self.store;
        let policy = &self.policy;
        let mut writes = stream::iter(rows.into_iter().map(|(_row, mutations)| async move {
            for mutation in mutations.iter() {
                policy.run("batch metadata write", move || store.apply(mutation)).await?;
            }
            Ok::<(), MetaError>(())
        }))
        .buffer_unordered(self.config.max_write_threads.max(1));
        while let Some(result) = writes.next().await {
            result?;
        }
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.flush().await
    }
}
