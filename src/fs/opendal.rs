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

use async_trait::async_trait;
use opendal::services::{HdfsNative, S3};
use opendal::{ErrorKind, Operator};

use super::{FileStatus, FileSystem};
use crate::error::{MetaError, Result};
use crate::service_uri::ServiceUri;

impl From<opendal::Error> for MetaError {
    fn from(err: opendal::Error) -> Self {
        match err.kind() {
            ErrorKind::PermissionDenied => MetaError::SecurityFailure { message: err.to_string() },
            _ if err.is_temporary() => MetaError::store_unavailable(err.to_string()),
            _ => MetaError::Internal(err.into()),
        }
    }
}

/// Filesystem over hdfs or s3.
pub struct OpenDALFileSystem {
    uri: ServiceUri,
    operator: Operator,
}

impl OpenDALFileSystem {
    /// Opens `hdfs://namenode:port/root` or `s3://bucket/root?endpoint=..&region=..`.
    pub fn open(uri: ServiceUri) -> Result<Arc<OpenDALFileSystem>> {
        let operator = match uri.scheme() {
            "hdfs" => {
                let name_node = format!("hdfs://{}", uri.address());
                Operator::new(HdfsNative::default().root(uri.root()).name_node(&name_node))?.finish()
            },
            "s3" => {
                let mut builder = S3::default().bucket(uri.address()).root(uri.root());
                if let Some(endpoint) = uri.param("endpoint") {
                    builder = builder.endpoint(endpoint);
                }
                if let Some(region) = uri.param("region") {
                    builder = builder.region(region);
                }
                Operator::new(builder)?.finish()
            },
            _ => return Err(MetaError::invalid_argument(format!("unsupported filesystem {uri}"))),
        };
        Ok(Arc::new(OpenDALFileSystem { uri, operator }))
    }

    fn dir_path(dir: &str) -> String {
        format!("{}/", dir.trim_end_matches('/'))
    }
}

#[async_trait]
impl FileSystem for OpenDALFileSystem {
    fn location(&self) -> &ServiceUri {
        &self.uri
    }

    async fn list(&self, dir: &str) -> Result<Vec<FileStatus>> {
        let dir = Self::dir_path(dir);
        let entries = match self.operator.list(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };
        let statuses = entries
            .into_iter()
            .filter(|entry| entry.path().trim_start_matches('/') != dir.trim_start_matches('/'))
            .map(|entry| FileStatus {
                name: entry.name().trim_end_matches('/').to_string(),
                is_dir: entry.metadata().is_dir(),
            })
            .collect();
        Ok(statuses)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.operator.exists(path).await?)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        if self.operator.exists(path).await? {
            self.operator.delete(path).await?;
            return Ok(true);
        }
        let dir = Self::dir_path(path);
        if !self.operator.exists(&dir).await? {
            return Ok(false);
        }
        self.operator.remove_all(&dir).await?;
        Ok(true)
    }
}
