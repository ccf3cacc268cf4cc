// Bounded retry for store operations
// Only `StoreError::Unavailable` is retried; an exhausted budget surfaces as
// `LockError::LockUnavailable`. An outage is never reported as a release.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hasp_common::{Backoff, LockConfig, LockError, QueueEntry};
use tracing::debug;

use crate::store::{LeaseStore, StoreError, StoreResult};

/// Retry budget for a single store operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &LockConfig) -> Self {
        Self {
            attempts: config.store_retry_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Single attempt, used where the caller has its own schedule
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the budget is spent.
///
/// `key` names the lock (or store record) the operation is about, for the
/// surfaced error.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    key: &str,
    mut operation: F,
) -> Result<T, LockError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut backoff = Backoff::new(policy.initial_backoff, policy.max_backoff);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Unavailable(reason)) if attempt < policy.attempts => {
                let delay = backoff.next_delay();
                debug!(
                    key = %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Store unavailable, retrying: {}",
                    reason
                );
                tokio::time::sleep(delay).await;
            }
            Err(StoreError::Unavailable(reason)) => {
                return Err(LockError::LockUnavailable {
                    key: key.to_string(),
                    attempts: attempt,
                    reason,
                });
            }
            Err(err @ StoreError::Protocol(_)) => return Err(err.into()),
        }
    }
}

/// `LeaseStore` wrapper that applies a `RetryPolicy` to every primitive and
/// reports failures in `LockError` terms
#[derive(Clone)]
pub struct RetryingStore {
    inner: Arc<dyn LeaseStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn LeaseStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &Arc<dyn LeaseStore> {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        with_retry(&self.policy, key, || self.inner.try_acquire(key, token, ttl)).await
    }

    pub async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        with_retry(&self.policy, key, || self.inner.renew(key, token, ttl)).await
    }

    pub async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        with_retry(&self.policy, key, || self.inner.release(key, token)).await
    }

    pub async fn current_token(&self, key: &str) -> Result<Option<String>, LockError> {
        with_retry(&self.policy, key, || self.inner.current_token(key)).await
    }

    pub async fn force_delete(&self, key: &str) -> Result<bool, LockError> {
        with_retry(&self.policy, key, || self.inner.force_delete(key)).await
    }

    pub async fn increment_if_below(
        &self,
        key: &str,
        member: &str,
        max: i64,
        ttl: Duration,
    ) -> Result<Option<i64>, LockError> {
        with_retry(&self.policy, key, || {
            self.inner.increment_if_below(key, member, max, ttl)
        })
        .await
    }

    pub async fn extend_counter(
        &self,
        key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        with_retry(&self.policy, key, || self.inner.extend_counter(key, member, ttl)).await
    }

    pub async fn decrement(&self, key: &str, member: &str) -> Result<bool, LockError> {
        with_retry(&self.policy, key, || self.inner.decrement(key, member)).await
    }

    pub async fn counter_value(&self, key: &str) -> Result<i64, LockError> {
        with_retry(&self.policy, key, || self.inner.counter_value(key)).await
    }

    pub async fn counter_contains(&self, key: &str, member: &str) -> Result<bool, LockError> {
        with_retry(&self.policy, key, || self.inner.counter_contains(key, member)).await
    }

    pub async fn queue_push(&self, key: &str, entry: &QueueEntry) -> Result<bool, LockError> {
        with_retry(&self.policy, key, || self.inner.queue_push(key, entry)).await
    }

    pub async fn queue_peek_head(&self, key: &str) -> Result<Option<QueueEntry>, LockError> {
        with_retry(&self.policy, key, || self.inner.queue_peek_head(key)).await
    }

    pub async fn queue_remove(&self, key: &str, requester: &str) -> Result<bool, LockError> {
        with_retry(&self.policy, key, || self.inner.queue_remove(key, requester)).await
    }

    pub async fn queue_len(&self, key: &str) -> Result<usize, LockError> {
        with_retry(&self.policy, key, || self.inner.queue_len(key)).await
    }

    pub async fn hash_put(&self, key: &str, field: &str, value: &str) -> Result<(), LockError> {
        with_retry(&self.policy, key, || self.inner.hash_put(key, field, value)).await
    }

    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, LockError> {
        with_retry(&self.policy, key, || self.inner.hash_get_all(key)).await
    }

    pub async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, LockError> {
        with_retry(&self.policy, key, || self.inner.hash_delete(key, field)).await
    }

    pub async fn publish(&self, channel: &str, message: &str) -> Result<(), LockError> {
        with_retry(&self.policy, channel, || self.inner.publish(channel, message)).await
    }
}
