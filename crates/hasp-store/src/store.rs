//! Lease store contract
//!
//! Every method is a single atomic operation at the store level: one round
//! trip, no read-then-write window.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hasp_common::{LockError, QueueEntry};

/// Store-level failure
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store unreachable; retryable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Store answered with something the adapter cannot interpret
    #[error("store protocol error: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for LockError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unavailable(reason) => LockError::StoreUnavailable(reason),
            StoreError::Protocol(reason) => {
                LockError::StoreUnavailable(format!("protocol error: {}", reason))
            }
        }
    }
}

/// Primitives the lock engine runs against the shared store
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Set `key` to `token` with `ttl` only if no live lease exists
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Extend the lease expiry; fails on token mismatch or absent key
    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Compare-and-delete
    async fn release(&self, key: &str, token: &str) -> StoreResult<bool>;

    /// Token of the live lease on `key`, if any
    async fn current_token(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete the lease on `key` whatever its token (admin operation)
    async fn force_delete(&self, key: &str) -> StoreResult<bool>;

    /// Count `member` into the counter on `key` when fewer than `max` live
    /// members are in it.
    ///
    /// Every member expires on its own after `ttl`; an expired member stops
    /// counting without anyone decrementing it. Re-adding a live member
    /// refreshes its expiry. Returns the live count, or `None` when full.
    async fn increment_if_below(
        &self,
        key: &str,
        member: &str,
        max: i64,
        ttl: Duration,
    ) -> StoreResult<Option<i64>>;

    /// Push a live member's expiry out to `ttl`; false if it already expired
    async fn extend_counter(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remove `member`. Returns whether it was still live; the counter is
    /// deleted once no member is left.
    async fn decrement(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Number of live members
    async fn counter_value(&self, key: &str) -> StoreResult<i64>;

    async fn counter_contains(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Append to the queue tail unless the requester is already queued.
    ///
    /// An existing entry keeps its position and takes the new deadline.
    /// Returns whether a new entry was appended.
    async fn queue_push(&self, key: &str, entry: &QueueEntry) -> StoreResult<bool>;

    /// Head of the queue; expired head entries are dropped first
    async fn queue_peek_head(&self, key: &str) -> StoreResult<Option<QueueEntry>>;

    async fn queue_remove(&self, key: &str, requester: &str) -> StoreResult<bool>;

    async fn queue_len(&self, key: &str) -> StoreResult<usize>;

    async fn hash_put(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;
}
