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

mod coordinator;
mod etcd;
mod memory;

pub use self::coordinator::{Coordinator, CoordinationLayout, LockId};
pub use self::etcd::{EtcdCoordinator, EtcdLease, SESSION_LEASE_DURATION};
pub use self::memory::MemoryCoordinator;
