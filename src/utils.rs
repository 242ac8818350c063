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

use tokio::sync::watch;

/// Signals all [DropWatcher]s once dropped.
#[derive(Debug)]
pub struct DropOwner {
    sender: watch::Sender<()>,
}

#[derive(Clone, Debug)]
pub struct DropWatcher {
    receiver: watch::Receiver<()>,
}

impl DropWatcher {
    /// Resolves after owner dropped.
    pub async fn dropped(&mut self) {
        while self.receiver.changed().await.is_ok() {}
    }

    pub fn is_dropped(&self) -> bool {
        self.receiver.has_changed().is_err()
    }
}

impl DropOwner {
    pub fn watch(&self) -> DropWatcher {
        DropWatcher { receiver: self.sender.subscribe() }
    }
}

pub fn drop_watcher() -> (DropOwner, DropWatcher) {
    let (sender, receiver) = watch::channel(());
    (DropOwner { sender }, DropWatcher { receiver })
}

/// Splits `s` into two at first `delimiter`, returns error message naming `what` if absent.
pub fn split_pair<'a>(s: &'a str, delimiter: char, what: &str) -> Result<(&'a str, &'a str), String> {
    s.split_once(delimiter).ok_or_else(|| format!("malformed {what}: {s:?}"))
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[tokio::test]
    async fn test_drop_watcher() {
        let (owner, mut watcher) = drop_watcher();
        let cloned = owner.watch();
        assert_that!(cloned.is_dropped()).is_false();
        drop(owner);
        watcher.dropped().await;
        assert_that!(cloned.is_dropped()).is_true();
    }

    #[test]
    fn test_split_pair() {
        assert_that!(split_pair("host:9997/wal1", '/', "log name")).is_equal_to(Ok(("host:9997", "wal1")));
        assert_that!(split_pair("wal1", '/', "log name").is_err()).is_true();
    }
}
