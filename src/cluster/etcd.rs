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

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use etcd_client::{
    Client,
    ConnectOptions,
    DeleteOptions,
    GetOptions,
    LeaseClient,
    LeaseKeepAliveStream,
    LeaseKeeper,
    LockOptions,
    Txn,
    TxnOp,
};
use ignore_result::Ignore;
use tokio::select;
use tracing::debug;

use super::coordinator::{Coordinator, LockId};
use crate::error::{MetaError, Result};
use crate::service_uri::ServiceUri;
use crate::utils::{self, DropOwner, DropWatcher};

pub const SESSION_LEASE_DURATION: Duration = Duration::from_secs(20);

impl From<etcd_client::Error> for MetaError {
    fn from(err: etcd_client::Error) -> Self {
        match err {
            etcd_client::Error::InvalidArgs(message) => MetaError::invalid_argument(message),
            err => MetaError::coordination(err.to_string()),
        }
    }
}

/// Lease backing a coordination session, revoked once dropped.
pub struct EtcdLease {
    id: i64,
    ttl: Duration,
    keep_alive: DropOwner,
}

impl EtcdLease {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn into_keep_alive(self) -> DropOwner {
        self.keep_alive
    }
}

pub(super) enum EtcdHelper {}

impl EtcdHelper {
    pub async fn connect(uri: &ServiceUri) -> anyhow::Result<Client> {
        let scheme = match (uri.scheme(), uri.is_tls()) {
            ("etcd", false) => "http",
            ("etcd", true) => "https",
            _ => bail!("unsupported coordination cluster: {uri}"),
        };
        let endpoints: Vec<_> = uri.servers().map(|server| format!("{scheme}://{server}")).collect();
        let mut options = ConnectOptions::default();
        if let Some((username, password)) = uri.credentials() {
            options = options.with_user(username, password);
        }
        Ok(Client::connect(&endpoints, Some(options)).await?)
    }

    // TODO: This method could leak lease during cancellation.
    pub async fn grant_lease(client: &mut Client, ttl: Option<Duration>) -> anyhow::Result<EtcdLease> {
        let response = client.lease_grant(ttl.unwrap_or(SESSION_LEASE_DURATION).as_secs() as i64, None).await?;
        let lease_id = response.id();
        let ttl = Duration::from_secs(response.ttl() as u64);
        let keep_alive = Self::keep_alive(client.lease_client(), lease_id, ttl).await?;
        Ok(EtcdLease { id: lease_id, ttl, keep_alive })
    }

    async fn heartbeat_lease(
        mut client: LeaseClient,
        mut keeper: LeaseKeeper,
        mut alive_stream: LeaseKeepAliveStream,
        mut watcher: DropWatcher,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(ttl / 2);
        loop {
            select! {
                _ = interval.tick() => {
                    keeper.keep_alive().await.ignore();
                },
                r = alive_stream.message() => match r? {
                    None => break,
                    Some(_) => continue,
                },
                _ = watcher.dropped() => {
                    client.revoke(keeper.id()).await?;
                    break;
                },
            }
        }
        Ok(())
    }

    pub async fn keep_alive(mut client: LeaseClient, lease_id: i64, ttl: Duration) -> anyhow::Result<DropOwner> {
        let (keeper, alive_stream) = client.keep_alive(lease_id).await?;
        let (owner, watcher) = utils::drop_watcher();
        tokio::spawn(Self::heartbeat_lease(client, keeper, alive_stream, watcher, ttl));
        Ok(owner)
    }

    /// Blocks until lock acquired, returns the owned lock key.
    pub async fn lock(client: &mut Client, path: &str, lease_id: i64) -> anyhow::Result<String> {
        let response = client.lock(path, Some(LockOptions::new().with_lease(lease_id))).await?;
        Ok(String::from_utf8(response.key().to_vec())?)
    }
}

/// [Coordinator] over etcd, where directories are key prefixes.
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
}

impl EtcdCoordinator {
    pub async fn connect(uri: &ServiceUri) -> Result<Self> {
        let client = EtcdHelper::connect(uri).await?;
        Ok(Self { client })
    }

    pub async fn grant_lease(&self, ttl: Option<Duration>) -> Result<EtcdLease> {
        let mut client = self.client.clone();
        Ok(EtcdHelper::grant_lease(&mut client, ttl).await?)
    }

    /// Acquires lock at `path` for session of given lease.
    pub async fn acquire_lock(&self, path: &str, lease: &EtcdLease) -> Result<LockId> {
        let mut client = self.client.clone();
        let key = EtcdHelper::lock(&mut client, path, lease.id()).await?;
        let node = key
            .strip_prefix(path)
            .and_then(|suffix| suffix.strip_prefix('/'))
            .ok_or_else(|| anyhow!("lock key {key} is not under {path}"))?;
        debug!("acquired lock {key} in lease {:x}", lease.id());
        Ok(LockId::new(path, node, lease.id()))
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn is_lock_held(&self, lock: &LockId) -> Result<bool> {
        let mut client = self.client.clone();
        let response = client.get(lock.node_path().as_str(), None).await?;
        Ok(response.kvs().first().is_some_and(|kv| kv.lease() == lock.session()))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{path}/");
        let mut client = self.client.clone();
        let response = client.get(prefix.as_str(), Some(GetOptions::new().with_prefix().with_keys_only())).await?;
        let mut children = BTreeSet::new();
        for kv in response.kvs() {
            let key = kv.key_str()?;
            let Some(suffix) = key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let name = suffix.split_once('/').map(|(name, _)| name).unwrap_or(suffix);
            if !name.is_empty() {
                children.insert(name.to_string());
            }
        }
        Ok(children.into_iter().collect())
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let response = client.get(path, None).await?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let response = client.get(path, Some(GetOptions::new().with_count_only())).await?;
        if response.count() > 0 {
            return Ok(true);
        }
        let prefix = format!("{path}/");
        let response = client.get(prefix, Some(GetOptions::new().with_prefix().with_count_only())).await?;
        Ok(response.count() > 0)
    }

    async fn put_persistent(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut client = self.client.clone();
        client.put(path, data, None).await?;
        Ok(())
    }

    async fn delete_recursive(&self, path: &str) -> Result<()> {
        let prefix = format!("{path}/");
        let txn = Txn::new().and_then([
            TxnOp::delete(path, None),
            TxnOp::delete(prefix, Some(DeleteOptions::new().with_prefix())),
        ]);
        self.client.kv_client().txn(txn).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use std::time::Duration;

    use assertor::*;
    use etcd_client::{EventType, PutOptions};
    use testcontainers::clients::Cli as DockerCli;
    use testcontainers::core::{Container, WaitFor};
    use testcontainers::images::generic::GenericImage;

    use super::*;

    pub struct EtcdContainer {
        container: Container<'static, GenericImage>,
    }

    impl EtcdContainer {
        pub fn uri(&self) -> ServiceUri {
            let cluster = format!("etcd://127.0.0.1:{}/tabletmeta", self.container.get_host_port_ipv4(2379));
            cluster.parse().unwrap()
        }
    }

    fn etcd_image() -> GenericImage {
        GenericImage::new("bitnami/etcd", "3.5.9")
            .with_env_var("ALLOW_NONE_AUTHENTICATION", "yes")
            .with_wait_for(WaitFor::StdErrMessage { message: "ready to serve client requests".to_string() })
    }

    pub fn etcd_container() -> EtcdContainer {
        let docker = DockerCli::default();
        let etcd = docker.run(etcd_image());
        EtcdContainer { container: unsafe { std::mem::transmute(etcd) } }
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_etcd_lease() {
        let etcd = etcd_container();
        let uri = etcd.uri();

        // given: granted lease and its ttl
        let mut client = EtcdHelper::connect(&uri).await.unwrap();
        let lease = EtcdHelper::grant_lease(&mut client, Some(Duration::from_secs(2))).await.unwrap();
        let ttl = lease.ttl();

        // when: sleep more than ttl
        tokio::time::sleep(ttl + Duration::from_secs(2)).await;

        // then: lease still hold
        let key = "/key1";
        client.put(key, vec![], Some(PutOptions::new().with_lease(lease.id()))).await.unwrap();

        // given: watch to leased key
        let (_watcher, mut stream) = client.watch(key, None).await.unwrap();

        // when: drop the lease
        drop(lease);

        // then: leased key deleted finally
        let message = stream.message().await.unwrap().unwrap();
        let event = message.events().last().unwrap();
        assert_that!(event.event_type()).is_equal_to(EventType::Delete);
        assert_that!(event.kv().unwrap().key()).is_equal_to(key.as_bytes());
    }

    #[test_log::test(tokio::test)]
    #[ignore = "requires docker"]
    async fn test_etcd_coordinator_nodes() {
        let etcd = etcd_container();
        let coordinator = EtcdCoordinator::connect(&etcd.uri()).await.unwrap();

        coordinator.put_persistent("/tm/root_tablet/walogs/wal1", b"1").await.unwrap();
        coordinator.put_persistent("/tm/root_tablet/walogs/wal2", b"2").await.unwrap();
        coordinator.put_persistent("/tm/root_tablet/location", b"host:9997").await.unwrap();

        let children = coordinator.children("/tm/root_tablet").await.unwrap();
        assert_that!(children).is_equal_to(vec!["location".to_string(), "walogs".to_string()]);
        assert_that!(coordinator.exists("/tm/root_tablet/walogs").await.unwrap()).is_true();
        let data = coordinator.get_data("/tm/root_tablet/walogs/wal2").await.unwrap();
        assert_that!(data).is_equal_to(Some(b"2".to_vec()));

        coordinator.delete_recursive("/tm/root_tablet/walogs").await.unwrap();
        assert_that!(coordinator.exists("/tm/root_tablet/walogs").await.unwrap()).is_false();
        let children = coordinator.children("/tm/root_tablet").await.unwrap();
        assert_that!(children).is_equal_to(vec!["location".to_string()]);
    }

    #[test_log::test(tokio::test)]
    #[ignore = "requires docker"]
    async fn test_etcd_coordinator_lock() {
        let etcd = etcd_container();
        let coordinator = EtcdCoordinator::connect(&etcd.uri()).await.unwrap();
        let lease = coordinator.grant_lease(Some(Duration::from_secs(5))).await.unwrap();

        let lock = coordinator.acquire_lock("/tm/tservers/host:9997", &lease).await.unwrap();
        assert_that!(lock.session()).is_equal_to(lease.id());
        assert_that!(coordinator.is_lock_held(&lock).await.unwrap()).is_true();

        let forged = LockId::new(lock.path(), lock.node(), lock.session() + 1);
        assert_that!(coordinator.is_lock_held(&forged).await.unwrap()).is_false();

        drop(lease);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_that!(coordinator.is_lock_held(&lock).await.unwrap()).is_false();
    }
}
