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

mod backend;
mod bulk;
mod clone;
mod context;
mod datafile;
mod extent;
mod gc;
pub mod schema;
mod split;
mod tablet;
mod wal;
mod writer;

pub use self::backend::{CoordinationBackend, DataFileUpdate, StoreBackend, TabletStateBackend};
pub use self::clone::CloneEngine;
pub use self::context::{MetadataConfig, MetadataContext};
pub use self::datafile::{split_data_files, DataFileValue, DataFiles};
pub use self::extent::{compare_end_rows, decode_prev_row, encode_prev_row, Extent};
pub use self::gc::{delete_marker, DeleteMarkerCollector, MarkerNamespace};
pub use self::schema::{ServerInstance, TabletMetadata};
pub use self::split::SplitRepairer;
pub use self::tablet::{NewTablet, ReplaceDatafiles};
pub use self::wal::{log_file_name, LogEntry};
pub use self::writer::{put_lock, MetadataWriter};
