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

//! Files of tablets, consulted for structural file list of root tablet and for tombstone reconciliation.

mod memory;
mod opendal;

use std::sync::Arc;

use async_trait::async_trait;

pub use self::memory::MemoryFileSystem;
pub use self::opendal::OpenDALFileSystem;
use crate::error::{MetaError, Result};
use crate::service_uri::ServiceUri;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStatus {
    /// Last path component.
    pub name: String,
    pub is_dir: bool,
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    fn location(&self) -> &ServiceUri;

    /// Lists direct entries of given directory, empty if directory does not exist.
    async fn list(&self, dir: &str) -> Result<Vec<FileStatus>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Deletes file or directory recursively, returns whether anything existed.
    async fn delete(&self, path: &str) -> Result<bool>;
}

/// Opens filesystem located by `uri`, e.g. `memory://files`, `hdfs://namenode:9000/tabletmeta`.
pub fn open(uri: ServiceUri) -> Result<Arc<dyn FileSystem>> {
    match uri.scheme() {
        "memory" => Ok(MemoryFileSystem::new(uri)),
        "hdfs" | "s3" => Ok(OpenDALFileSystem::open(uri)?),
        scheme => Err(MetaError::invalid_argument(format!("unsupported filesystem scheme {scheme}"))),
    }
}
