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

//! Retry loop shared by metadata writes and coordination calls.

use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{MetaError, Result};
use crate::utils::DropWatcher;

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Abort,
}

pub type ErrorClassifier = Arc<dyn Fn(&MetaError) -> RetryDecision + Send + Sync>;

/// Retries infrastructure failures and also constraint violations and missing tables, as metadata writers
/// have always done.
pub fn lenient_classifier(err: &MetaError) -> RetryDecision {
    match err {
        _ if err.is_transient() => RetryDecision::Retry,
        MetaError::ConstraintViolation { .. } | MetaError::TableNotFound { .. } => RetryDecision::Retry,
        _ => RetryDecision::Abort,
    }
}

/// Retries infrastructure failures only.
pub fn strict_classifier(err: &MetaError) -> RetryDecision {
    match err.is_transient() {
        true => RetryDecision::Retry,
        false => RetryDecision::Abort,
    }
}

/// Fixed backoff retry, unbounded unless given a deadline or a cancellation signal.
#[derive(Clone)]
pub struct RetryPolicy {
    backoff: Duration,
    deadline: Option<Duration>,
    cancellation: Option<DropWatcher>,
    classifier: ErrorClassifier,
}

impl Debug for RetryPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("backoff", &self.backoff)
            .field("deadline", &self.deadline)
            .field("cancellable", &self.cancellation.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_RETRY_BACKOFF,
            deadline: None,
            cancellation: None,
            classifier: Arc::new(lenient_classifier),
        }
    }
}

impl RetryPolicy {
    pub fn strict() -> Self {
        Self::default().with_classifier(strict_classifier)
    }

    pub fn with_backoff(self, backoff: Duration) -> Self {
        Self { backoff, ..self }
    }

    /// Bounds total time spent in [RetryPolicy::run], measured from its start.
    pub fn with_deadline(self, deadline: Duration) -> Self {
        Self { deadline: Some(deadline), ..self }
    }

    pub fn with_cancellation(self, watcher: DropWatcher) -> Self {
        Self { cancellation: Some(watcher), ..self }
    }

    pub fn with_classifier(self, classifier: impl Fn(&MetaError) -> RetryDecision + Send + Sync + 'static) -> Self {
        Self { classifier: Arc::new(classifier), ..self }
    }

    #[inline]
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn classify(&self, err: &MetaError) -> RetryDecision {
        (self.classifier)(err)
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>, {
        let deadline = self.deadline.map(|duration| Instant::now() + duration);
        let mut cancellation = self.cancellation.clone();
        let mut attempts = 0u64;
        loop {
            if cancellation.as_ref().is_some_and(|watcher| watcher.is_dropped()) {
                return Err(MetaError::Cancelled { operation: operation.to_string() });
            }
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempts += 1;
            if self.classify(&err) == RetryDecision::Abort {
                return Err(err);
            }
            if deadline.is_some_and(|deadline| Instant::now() + self.backoff >= deadline) {
                return Err(MetaError::DeadlineExceeded { operation: operation.to_string(), last: Box::new(err) });
            }
            warn!("{operation} failed in attempt {attempts}, retry after {:?}: {err}", self.backoff);
            match cancellation.as_mut() {
                None => tokio::time::sleep(self.backoff).await,
                Some(watcher) => select! {
                    _ = tokio::time::sleep(self.backoff) => {},
                    _ = watcher.dropped() => return Err(MetaError::Cancelled { operation: operation.to_string() }),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assertor::*;

    use super::*;
    use crate::utils;

    fn fast() -> RetryPolicy {
        RetryPolicy::default().with_backoff(Duration::from_millis(1))
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn test_retry_until_success() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let value = fast()
            .run("flaky", move || async move {
                match attempts.fetch_add(1, Ordering::SeqCst) {
                    0..=2 => Err(MetaError::store_unavailable("down")),
                    _ => Ok(5),
                }
            })
            .await
            .unwrap();
        assert_that!(value).is_equal_to(5);
        assert_that!(attempts.load(Ordering::SeqCst)).is_equal_to(4);
        assert!(logs_contain("flaky failed in attempt 3"));
    }

    #[tokio::test]
    async fn test_retry_constraint_violation_by_default() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        fast()
            .run("fenced", move || async move {
                match attempts.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(MetaError::constraint_violation("1;m", "lock lost")),
                    _ => Ok(()),
                }
            })
            .await
            .unwrap();
        assert_that!(attempts.load(Ordering::SeqCst)).is_equal_to(2);
    }

    #[tokio::test]
    async fn test_strict_aborts_constraint_violation() {
        let err = RetryPolicy::strict()
            .run("fenced", || async { Err::<(), _>(MetaError::constraint_violation("1;m", "lock lost")) })
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn test_corruption_never_retried() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let err = fast()
            .run("repair", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MetaError::corrupted("no split ratio"))
            })
            .await
            .unwrap_err();
        assert!(err.is_corruption());
        assert_that!(attempts.load(Ordering::SeqCst)).is_equal_to(1);
    }

    #[tokio::test]
    async fn test_deadline() {
        let err = fast()
            .with_deadline(Duration::from_millis(20))
            .run("down", || async { Err::<(), _>(MetaError::coordination("disconnected")) })
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::DeadlineExceeded { .. }));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (owner, watcher) = utils::drop_watcher();
        let policy = RetryPolicy::default().with_cancellation(watcher);
        let handle = tokio::spawn(async move {
            policy.run("down", || async { Err::<(), _>(MetaError::coordination("disconnected")) }).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(owner);
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, MetaError::Cancelled { .. }));
    }
}
