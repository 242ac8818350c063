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
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hashbrown::HashSet;

use super::coordinator::{Coordinator, LockId};
use crate::error::{MetaError, Result};

#[derive(Default)]
struct MemoryState {
    nodes: BTreeMap<String, Vec<u8>>,
    locks: HashSet<LockId>,
    sequence: i64,
    failures: usize,
    vanishing: Vec<String>,
}

impl MemoryState {
    fn check_failure(&mut self) -> Result<()> {
        if self.failures == 0 {
            return Ok(());
        }
        self.failures -= 1;
        Err(MetaError::coordination("injected failure"))
    }

    fn delete_recursive(&mut self, path: &str) {
        let prefix = format!("{path}/");
        self.nodes.remove(path);
        self.nodes.retain(|key, _| !key.starts_with(&prefix));
    }
}

/// In memory [Coordinator] with failure injection.
#[derive(Default)]
pub struct MemoryCoordinator {
    state: Mutex<MemoryState>,
}

impl MemoryCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquires lock at `path` in a fresh session.
    pub fn acquire_lock(&self, path: &str) -> LockId {
        let mut state = self.state.lock().unwrap();
        state.sequence += 1;
        let lock = LockId::new(path, format!("zlock-{:010}", state.sequence), 0x1000 + state.sequence);
        state.locks.insert(lock.clone());
        lock
    }

    /// Releases lock as if its session expired.
    pub fn release_lock(&self, lock: &LockId) {
        self.state.lock().unwrap().locks.remove(lock);
    }

    /// Fails next `n` operations with [MetaError::CoordinationUnavailable].
    pub fn inject_failures(&self, n: usize) {
        self.state.lock().unwrap().failures = n;
    }

    /// Deletes node at `path` right after next [Coordinator::children] returns.
    pub fn vanish_after_listing(&self, path: impl Into<String>) {
        self.state.lock().unwrap().vanishing.push(path.into());
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn is_lock_held(&self, lock: &LockId) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.check_failure()?;
        Ok(state.locks.contains(lock))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.check_failure()?;
        let prefix = format!("{path}/");
        let children: BTreeSet<String> = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].split('/').next().filter(|name| !name.is_empty()))
            .map(|name| name.to_string())
            .collect();
        for vanished in std::mem::take(&mut state.vanishing) {
            state.delete_recursive(&vanished);
        }
        Ok(children.into_iter().collect())
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        state.check_failure()?;
        Ok(state.nodes.get(path).cloned())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.check_failure()?;
        let prefix = format!("{path}/");
        let parent = state.nodes.range(prefix.clone()..).next().is_some_and(|(key, _)| key.starts_with(&prefix));
        Ok(parent || state.nodes.contains_key(path))
    }

    async fn put_persistent(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_failure()?;
        state.nodes.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete_recursive(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_failure()?;
        state.delete_recursive(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[tokio::test]
    async fn test_nodes() {
        let coordinator = MemoryCoordinator::new();
        coordinator.put_persistent("/tm/root_tablet/walogs/wal1", b"1").await.unwrap();
        coordinator.put_persistent("/tm/root_tablet/walogs/wal2", b"2").await.unwrap();
        coordinator.put_persistent("/tm/root_tablet/location", b"host:9997").await.unwrap();
        coordinator.put_persistent("/tm/root_tablets", b"x").await.unwrap();

        let children = coordinator.children("/tm/root_tablet").await.unwrap();
        assert_that!(children).is_equal_to(vec!["location".to_string(), "walogs".to_string()]);
        assert_that!(coordinator.exists("/tm/root_tablet/walogs").await.unwrap()).is_true();
        let data = coordinator.get_data("/tm/root_tablet/walogs/wal1").await.unwrap();
        assert_that!(data).is_equal_to(Some(b"1".to_vec()));

        coordinator.put_persistent("/tm/root_tablet/walogs/wal1", b"3").await.unwrap();
        let data = coordinator.get_data("/tm/root_tablet/walogs/wal1").await.unwrap();
        assert_that!(data).is_equal_to(Some(b"3".to_vec()));

        coordinator.delete_recursive("/tm/root_tablet/walogs").await.unwrap();
        assert_that!(coordinator.exists("/tm/root_tablet/walogs").await.unwrap()).is_false();
        assert_that!(coordinator.exists("/tm/root_tablets").await.unwrap()).is_true();
        let children = coordinator.children("/tm/root_tablet").await.unwrap();
        assert_that!(children).is_equal_to(vec!["location".to_string()]);
    }

    #[tokio::test]
    async fn test_locks() {
        let coordinator = MemoryCoordinator::new();
        let lock1 = coordinator.acquire_lock("/tm/tservers/host1:9997");
        let lock2 = coordinator.acquire_lock("/tm/tservers/host2:9997");
        assert_that!(lock1.session()).is_not_equal_to(lock2.session());
        assert_that!(coordinator.is_lock_held(&lock1).await.unwrap()).is_true();

        coordinator.release_lock(&lock1);
        assert_that!(coordinator.is_lock_held(&lock1).await.unwrap()).is_false();
        assert_that!(coordinator.is_lock_held(&lock2).await.unwrap()).is_true();
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let coordinator = MemoryCoordinator::new();
        coordinator.inject_failures(1);
        assert!(coordinator.exists("/tm").await.unwrap_err().is_transient());
        assert_that!(coordinator.exists("/tm").await.unwrap()).is_false();
    }

    #[tokio::test]
    async fn test_vanish_after_listing() {
        let coordinator = MemoryCoordinator::new();
        coordinator.put_persistent("/walogs/wal1", b"1").await.unwrap();
        coordinator.vanish_after_listing("/walogs/wal1");
        assert_that!(coordinator.children("/walogs").await.unwrap()).is_equal_to(vec!["wal1".to_string()]);
        assert_that!(coordinator.get_data("/walogs/wal1").await.unwrap()).is_none();
    }
}
