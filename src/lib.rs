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

//! Metadata control plane for a sharded tablet store.
//!
//! Every tablet of every table owns one row in the metadata store. The metadata table's own shard, the
//! root tablet, cannot describe itself there, so its write-ahead-log references live in a coordination
//! service instead. [metadata::MetadataContext] hides that split behind [metadata::TabletStateBackend].

pub mod clock;
pub mod cluster;
pub mod error;
pub mod fs;
pub mod keys;
pub mod metadata;
pub mod retry;
pub mod service_uri;
pub mod store;
pub mod utils;

pub use self::error::{MetaError, Result};
