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

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Cell, Column, ColumnUpdate, MetadataStore, Mutation, ScanRange, LOCK_COLUMN};
use crate::clock::{Clock, Millis};
use crate::cluster::{Coordinator, LockId};
use crate::error::{MetaError, Result};

type Columns = BTreeMap<Column, (Millis, Vec<u8>)>;

#[derive(Default)]
struct StoreState {
    rows: BTreeMap<Vec<u8>, Columns>,
    failures: usize,
    crash_countdown: Option<usize>,
    history: Vec<Mutation>,
}

impl StoreState {
    fn check_failure(&mut self) -> Result<()> {
        if self.crash_countdown == Some(0) {
            return Err(MetaError::store_unavailable("store crashed"));
        }
        if self.failures > 0 {
            self.failures -= 1;
            return Err(MetaError::store_unavailable("injected failure"));
        }
        Ok(())
    }
}

/// In memory [MetadataStore] fencing writers through given [Coordinator].
pub struct MemoryMetadataStore {
    clock: Clock,
    coordinator: Option<Arc<dyn Coordinator>>,
    /// Held from fence check through apply, so both act as one conditional write.
    writes: tokio::sync::Mutex<()>,
    state: Mutex<StoreState>,
}

impl MemoryMetadataStore {
    /// Store that accepts lock column as plain data.
    pub fn new() -> Arc<Self> {
        Self::with_coordinator(None)
    }

    /// Store that rejects mutations from writers not holding their locks.
    pub fn fenced(coordinator: Arc<dyn Coordinator>) -> Arc<Self> {
        Self::with_coordinator(Some(coordinator))
    }

    fn with_coordinator(coordinator: Option<Arc<dyn Coordinator>>) -> Arc<Self> {
        Arc::new(Self {
            clock: Clock::new(),
            coordinator,
            writes: tokio::sync::Mutex::new(()),
            state: Mutex::new(StoreState::default()),
        })
    }

    /// Fails next `n` applies and scans with [MetaError::StoreUnavailable].
    pub fn inject_failures(&self, n: usize) {
        self.state.lock().unwrap().failures = n;
    }

    /// Fails every operation after next `n` successful applies until [MemoryMetadataStore::recover].
    pub fn crash_after(&self, n: usize) {
        self.state.lock().unwrap().crash_countdown = Some(n);
    }

    pub fn recover(&self) {
        self.state.lock().unwrap().crash_countdown = None;
    }

    /// Mutations applied so far in order.
    pub fn history(&self) -> Vec<Mutation> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn rows(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().rows.keys().cloned().collect()
    }

    async fn check_fence(&self, mutation: &Mutation) -> Result<()> {
        let (Some(coordinator), Some(value)) = (self.coordinator.as_ref(), mutation.value_of(&LOCK_COLUMN)) else {
            return Ok(());
        };
        let row = String::from_utf8_lossy(mutation.row()).into_owned();
        let lock: LockId = std::str::from_utf8(value)
            .ok()
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| MetaError::constraint_violation(row.as_str(), "malformed lock column"))?;
        if !coordinator.is_lock_held(&lock).await? {
            return Err(MetaError::constraint_violation(row, format!("lock {lock} not held")));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn apply(&self, mutation: &Mutation) -> Result<()> {
        let _write = self.writes.lock().await;
        self.state.lock().unwrap().check_failure()?;
        self.check_fence(mutation).await?;
        let mut state = self.state.lock().unwrap();
        state.check_failure()?;
        let columns = state.rows.entry(mutation.row().to_vec()).or_default();
        for update in mutation.updates() {
            match update {
                ColumnUpdate::Put { column, .. } if *column == LOCK_COLUMN => {},
                ColumnUpdate::Put { column, value, timestamp } => {
                    let timestamp = timestamp.unwrap_or_else(|| self.clock.now());
                    columns.insert(column.clone(), (timestamp, value.clone()));
                },
                ColumnUpdate::Delete { column } => {
                    columns.remove(column);
                },
            }
        }
        if columns.is_empty() {
            state.rows.remove(mutation.row());
        }
        if let Some(countdown) = state.crash_countdown.as_mut() {
            *countdown -= 1;
        }
        state.history.push(mutation.clone());
        Ok(())
    }

    async fn scan(&self, range: &ScanRange) -> Result<Vec<Cell>> {
        let mut state = self.state.lock().unwrap();
        state.check_failure()?;
        let mut cells = Vec::new();
        for (row, columns) in state.rows.range((range.start.clone(), range.end.clone())) {
            for (column, (timestamp, value)) in columns {
                if range.contains_family(&column.family) {
                    let column = column.clone();
                    cells.push(Cell { row: row.clone(), column, timestamp: *timestamp, value: value.clone() });
                }
            }
        }
        Ok(cells)
    }
}
