//! Fair (FIFO) lock
//!
//! Requesters queue on an ordered list and only the head may take the
//! resource's exclusive lease, so a fair holder and an exclusive holder
//! never coexist. Queue entries carry a deadline that every push
//! refreshes, so an entry left behind by a crashed requester is dropped
//! at the next head peek instead of blocking the queue forever.

use std::time::Duration;

use hasp_common::{
    KeySpace, LockError, LockKey, LockToken, QueueEntry, Result, WaiterId, current_timestamp,
};
use hasp_store::RetryingStore;
use tracing::{debug, warn};

pub struct FairLock {
    store: RetryingStore,
    keys: KeySpace,
    entry_grace: Duration,
}

impl FairLock {
    pub fn new(store: RetryingStore, keys: KeySpace, entry_grace: Duration) -> Self {
        Self {
            store,
            keys,
            entry_grace,
        }
    }

    /// Enqueue (or refresh) `requester`, then take the lease if it is at the
    /// head. A requester that does not win stays queued.
    pub async fn try_acquire(
        &self,
        requester: &WaiterId,
        key: &LockKey,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool> {
        let queue = self.keys.fair_queue(key);
        let me = requester.to_string();
        let now = current_timestamp();
        let entry = QueueEntry::new(me.clone(), now, now + self.entry_grace.as_millis() as i64);

        if self.store.queue_push(&queue, &entry).await? {
            debug!(key = %queue, requester = %me, "Fair queue entry added");
        }

        match self.store.queue_peek_head(&queue).await? {
            Some(head) if head.requester == me => {}
            _ => return Ok(false),
        }

        if !self
            .store
            .try_acquire(&self.keys.exclusive(key), token.as_str(), ttl)
            .await?
        {
            return Ok(false);
        }

        if let Err(e) = self.store.queue_remove(&queue, &me).await {
            warn!(
                key = %queue,
                requester = %me,
                "Granted requester still queued, entry expires on its own: {}",
                e
            );
        }
        Ok(true)
    }

    /// Remove an abandoned waiter from the queue. A failed removal is only
    /// logged: the entry ages out by its deadline.
    pub async fn leave_queue(&self, requester: &WaiterId, key: &LockKey) {
        let queue = self.keys.fair_queue(key);
        let me = requester.to_string();
        if let Err(e) = self.store.queue_remove(&queue, &me).await {
            let abandoned = LockError::QueueAbandoned {
                key: queue,
                requester: me,
                reason: e.to_string(),
            };
            warn!("{}", abandoned);
        }
    }

    pub async fn release(&self, key: &LockKey, token: &LockToken) -> Result<bool> {
        self.store.release(&self.keys.exclusive(key), token.as_str()).await
    }

    pub async fn renew(&self, key: &LockKey, token: &LockToken, ttl: Duration) -> Result<bool> {
        self.store
            .renew(&self.keys.exclusive(key), token.as_str(), ttl)
            .await
    }

    pub async fn is_held_by(&self, key: &LockKey, token: &LockToken) -> Result<bool> {
        let current = self.store.current_token(&self.keys.exclusive(key)).await?;
        Ok(current.as_deref() == Some(token.as_str()))
    }

    /// Non-authoritative queue length
    pub async fn queue_length(&self, key: &LockKey) -> Result<usize> {
        self.store.queue_len(&self.keys.fair_queue(key)).await
    }
}
