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

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use async_trait::async_trait;
use compact_str::{format_compact, CompactString};

use crate::error::{MetaError, Result};

/// Identity of a lock holder.
///
/// A lock is a node `{path}/{node}` owned by a session. Writes carrying a [LockId] are accepted only while
/// that node still exists under the same session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockId {
    path: CompactString,
    node: CompactString,
    session: i64,
}

impl LockId {
    pub fn new(path: impl Into<CompactString>, node: impl Into<CompactString>, session: i64) -> Self {
        Self { path: path.into(), node: node.into(), session }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn session(&self) -> i64 {
        self.session
    }

    /// Full path of the lock node.
    pub fn node_path(&self) -> CompactString {
        format_compact!("{}/{}", self.path, self.node)
    }

    /// Session identity in the form used as location column qualifier.
    pub fn session_hex(&self) -> CompactString {
        format_compact!("{:x}", self.session)
    }
}

impl Display for LockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}${:x}", self.path, self.node, self.session)
    }
}

impl FromStr for LockId {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || MetaError::invalid_argument(format!("malformed lock id: {s:?}"));
        let (node_path, session) = s.rsplit_once('$').ok_or_else(invalid)?;
        let (path, node) = node_path.rsplit_once('/').ok_or_else(invalid)?;
        if node.is_empty() {
            return Err(invalid());
        }
        let session = u64::from_str_radix(session, 16).map_err(|_| invalid())? as i64;
        Ok(Self::new(path, node, session))
    }
}

/// Strongly consistent hierarchical store with session scoped locks.
///
/// Paths are slash separated. A path exists if it has data or has descendants.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn is_lock_held(&self, lock: &LockId) -> Result<bool>;

    /// Names of direct children, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Writes data to node, overwriting existing data.
    async fn put_persistent(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Deletes node and all its descendants, succeeds if nothing exists.
    async fn delete_recursive(&self, path: &str) -> Result<()>;
}

/// Node layout of one instance in coordination service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinationLayout {
    root: CompactString,
}

impl CoordinationLayout {
    pub fn new(root: impl Into<CompactString>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Directory holding one node per write-ahead log of root tablet.
    pub fn root_tablet_walogs(&self) -> CompactString {
        format_compact!("{}/root_tablet/walogs", self.root)
    }

    pub fn root_tablet_walog(&self, filename: &str) -> CompactString {
        format_compact!("{}/root_tablet/walogs/{}", self.root, filename)
    }

    /// Node holding serving address of root tablet.
    pub fn root_tablet_location(&self) -> CompactString {
        format_compact!("{}/root_tablet/location", self.root)
    }

    /// Lock path of tablet server at given address.
    pub fn tserver_lock(&self, address: &str) -> CompactString {
        format_compact!("{}/tservers/{}", self.root, address)
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn test_lock_id() {
        let lock = LockId::new("/tm/tservers/host:9997", "zlock-0000000001", 0x1f2e);
        let serialized = lock.to_string();
        assert_that!(serialized.as_str()).is_equal_to("/tm/tservers/host:9997/zlock-0000000001$1f2e");
        assert_that!(serialized.parse::<LockId>().unwrap()).is_equal_to(lock.clone());
        assert_that!(lock.node_path().as_str()).is_equal_to("/tm/tservers/host:9997/zlock-0000000001");
        assert_that!(lock.session_hex().as_str()).is_equal_to("1f2e");
    }

    #[test]
    fn test_lock_id_negative_session() {
        let lock = LockId::new("/locks", "a", -2);
        assert_that!(lock.to_string().parse::<LockId>().unwrap()).is_equal_to(lock);
    }

    #[test]
    fn test_lock_id_malformed() {
        assert!(matches!("/locks/a".parse::<LockId>(), Err(MetaError::InvalidArgument { .. })));
        assert!(matches!("/locks/$1".parse::<LockId>(), Err(MetaError::InvalidArgument { .. })));
        assert!(matches!("/locks/a$xyz".parse::<LockId>(), Err(MetaError::InvalidArgument { .. })));
    }

    #[test]
    fn test_layout() {
        let layout = CoordinationLayout::new("/tm");
        assert_that!(layout.root_tablet_walogs().as_str()).is_equal_to("/tm/root_tablet/walogs");
        assert_that!(layout.root_tablet_walog("wal1").as_str()).is_equal_to("/tm/root_tablet/walogs/wal1");
        assert_that!(layout.root_tablet_location().as_str()).is_equal_to("/tm/root_tablet/location");
        assert_that!(layout.tserver_lock("host:9997").as_str()).is_equal_to("/tm/tservers/host:9997");
    }
}
