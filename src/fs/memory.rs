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

use super::{FileStatus, FileSystem};
use crate::error::Result;
use crate::service_uri::ServiceUri;

/// Files in memory, directories exist implicitly as long as they have files.
pub struct MemoryFileSystem {
    uri: ServiceUri,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryFileSystem {
    pub fn new(uri: ServiceUri) -> Arc<Self> {
        Arc::new(Self { uri, files: Mutex::new(BTreeMap::new()) })
    }

    pub fn put(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(path.into(), content.into());
    }

    pub fn files(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    fn location(&self) -> &ServiceUri {
        &self.uri
    }

    async fn list(&self, dir: &str) -> Result<Vec<FileStatus>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let files = self.files.lock().unwrap();
        let mut statuses: Vec<FileStatus> = Vec::new();
        for path in files.range(prefix.clone()..).map(|(path, _)| path).take_while(|path| path.starts_with(&prefix)) {
            let status = match path[prefix.len()..].split_once('/') {
                None => FileStatus { name: path[prefix.len()..].to_string(), is_dir: false },
                Some((name, _)) => FileStatus { name: name.to_string(), is_dir: true },
            };
            if statuses.last() != Some(&status) {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let prefix = format!("{path}/");
        let files = self.files.lock().unwrap();
        let parent = files.range(prefix.clone()..).next().is_some_and(|(key, _)| key.starts_with(&prefix));
        Ok(parent || files.contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let prefix = format!("{path}/");
        let mut files = self.files.lock().unwrap();
        let n = files.len();
        files.remove(path);
        files.retain(|key, _| !key.starts_with(&prefix));
        Ok(files.len() != n)
    }
}
