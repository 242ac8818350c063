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
use std::time::SystemTime;

use static_assertions::{assert_impl_all, assert_not_impl_any};

/// Milliseconds since unix epoch.
pub type Millis = u64;

/// Strictly increasing millisecond clock used to stamp metadata cells.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<MonotonicClock>,
}

impl Clock {
    pub fn new() -> Self {
        Self { inner: Arc::new(MonotonicClock::new()) }
    }

    pub fn now(&self) -> Millis {
        self.inner.now()
    }

    /// Observes a timestamp from elsewhere so later [Clock::now] exceeds it.
    pub fn update(&self, timestamp: Millis) {
        self.inner.update(timestamp)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

fn system_time_now() -> Millis {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|elapsed| elapsed.as_millis() as Millis).unwrap_or(0)
}

struct MonotonicClock {
    mutex: spin::Mutex<Millis>,
}

assert_impl_all!(MonotonicClock: Send, Sync);
assert_not_impl_any!(MonotonicClock: Clone, Copy);

impl MonotonicClock {
    fn new() -> Self {
        Self { mutex: spin::Mutex::new(system_time_now()) }
    }

    fn now(&self) -> Millis {
        let now = system_time_now();
        let mut last = self.mutex.lock();
        *last = if now <= *last { *last + 1 } else { now };
        *last
    }

    fn update(&self, timestamp: Millis) {
        let mut last = self.mutex.lock();
        if timestamp > *last {
            *last = timestamp;
        }
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn test_clock_monotonic() {
        let clock = Clock::new();
        let mut old = clock.now();
        for i in 0..5000 {
            clock.update(old.saturating_sub(i));
            let now = clock.now();
            assert_that!(now).is_greater_than(old);
            old = now;
        }
    }

    #[test]
    fn test_clock_advance() {
        let clock = Clock::new();
        let future = clock.now() + 3_000_000;
        clock.update(future);
        assert_that!(clock.now()).is_greater_than(future);
    }
}
