//! Read-write lock
//!
//! State per key: a `readers` counter holding one expiring member per reader
//! token, a `writer` lease and (with writer priority) a `writer-waiting`
//! lease. A reader that stops renewing drops out of the count on its own.
//!
//! The store offers no multi-key transaction, so both sides publish first
//! and check second: a reader increments `readers` then re-checks `writer`,
//! a writer takes `writer` then re-checks `readers`. Whichever side sees the
//! other backs out, so a reader and a writer never both succeed.

use std::time::Duration;

use hasp_common::{KeySpace, LockKey, LockToken, Result};
use hasp_store::RetryingStore;
use tracing::debug;

pub struct ReadWriteLock {
    store: RetryingStore,
    keys: KeySpace,
    writer_priority: bool,
}

impl ReadWriteLock {
    pub fn new(store: RetryingStore, keys: KeySpace, writer_priority: bool) -> Self {
        Self {
            store,
            keys,
            writer_priority,
        }
    }

    pub async fn try_read(&self, key: &LockKey, token: &LockToken, ttl: Duration) -> Result<bool> {
        if self.writer_priority
            && self
                .store
                .current_token(&self.keys.writer_waiting(key))
                .await?
                .is_some()
        {
            return Ok(false);
        }
        let writer = self.keys.writer(key);
        if self.store.current_token(&writer).await?.is_some() {
            return Ok(false);
        }

        let readers = self.keys.readers(key);
        if self
            .store
            .increment_if_below(&readers, token.as_str(), i64::MAX, ttl)
            .await?
            .is_none()
        {
            return Ok(false);
        }

        match self.store.current_token(&writer).await {
            Ok(None) => Ok(true),
            Ok(Some(_)) => {
                self.undo_read(&readers, token).await;
                Ok(false)
            }
            Err(e) => {
                self.undo_read(&readers, token).await;
                Err(e)
            }
        }
    }

    async fn undo_read(&self, readers: &str, token: &LockToken) {
        if let Err(e) = self.store.decrement(readers, token.as_str()).await {
            debug!(key = %readers, "Failed to roll back reader entry: {}", e);
        }
    }

    /// Drop a reader. Returns false when the token's entry already expired
    /// or was released.
    pub async fn release_read(&self, key: &LockKey, token: &LockToken) -> Result<bool> {
        self.store
            .decrement(&self.keys.readers(key), token.as_str())
            .await
    }

    pub async fn renew_read(
        &self,
        key: &LockKey,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool> {
        self.store
            .extend_counter(&self.keys.readers(key), token.as_str(), ttl)
            .await
    }

    pub async fn try_write(&self, key: &LockKey, token: &LockToken, ttl: Duration) -> Result<bool> {
        let readers = self.keys.readers(key);
        if self.store.counter_value(&readers).await? > 0 {
            return Ok(false);
        }

        let writer = self.keys.writer(key);
        if !self.store.try_acquire(&writer, token.as_str(), ttl).await? {
            return Ok(false);
        }

        match self.store.counter_value(&readers).await {
            Ok(0) => Ok(true),
            Ok(_) => {
                self.store.release(&writer, token.as_str()).await?;
                Ok(false)
            }
            Err(e) => {
                if let Err(release_err) = self.store.release(&writer, token.as_str()).await {
                    debug!(key = %writer, "Writer lease left to expire: {}", release_err);
                }
                Err(e)
            }
        }
    }

    pub async fn release_write(&self, key: &LockKey, token: &LockToken) -> Result<bool> {
        self.store
            .release(&self.keys.writer(key), token.as_str())
            .await
    }

    pub async fn renew_write(
        &self,
        key: &LockKey,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool> {
        self.store
            .renew(&self.keys.writer(key), token.as_str(), ttl)
            .await
    }

    /// Keep the writer-waiting flag up while a writer is blocked
    pub async fn mark_writer_waiting(
        &self,
        key: &LockKey,
        token: &LockToken,
        remaining: Duration,
    ) -> Result<()> {
        if !self.writer_priority {
            return Ok(());
        }
        let flag = self.keys.writer_waiting(key);
        let ttl = remaining.max(Duration::from_millis(1));
        if !self.store.renew(&flag, token.as_str(), ttl).await? {
            self.store.try_acquire(&flag, token.as_str(), ttl).await?;
        }
        Ok(())
    }

    pub async fn clear_writer_waiting(&self, key: &LockKey, token: &LockToken) {
        if !self.writer_priority {
            return;
        }
        let flag = self.keys.writer_waiting(key);
        if let Err(e) = self.store.release(&flag, token.as_str()).await {
            debug!(key = %flag, "Writer-waiting flag left to expire: {}", e);
        }
    }

    pub async fn read_held_by(&self, key: &LockKey, token: &LockToken) -> Result<bool> {
        self.store
            .counter_contains(&self.keys.readers(key), token.as_str())
            .await
    }

    pub async fn write_held_by(&self, key: &LockKey, token: &LockToken) -> Result<bool> {
        let current = self.store.current_token(&self.keys.writer(key)).await?;
        Ok(current.as_deref() == Some(token.as_str()))
    }

    pub async fn reader_count(&self, key: &LockKey) -> Result<i64> {
        self.store.counter_value(&self.keys.readers(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hasp_store::{MemoryLeaseStore, RetryPolicy};
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(5);

    fn rwlock(writer_priority: bool) -> ReadWriteLock {
        let store = RetryingStore::new(Arc::new(MemoryLeaseStore::new()), RetryPolicy::no_retry());
        ReadWriteLock::new(store, KeySpace::default(), writer_priority)
    }

    fn key() -> LockKey {
        LockKey::new("doc", "7").unwrap()
    }

    #[tokio::test]
    async fn test_readers_share_and_exclude_writer() {
        let lock = rwlock(false);
        let (r1, r2, w) = (LockToken::generate(), LockToken::generate(), LockToken::generate());

        assert!(lock.try_read(&key(), &r1, TTL).await.unwrap());
        assert!(lock.try_read(&key(), &r2, TTL).await.unwrap());
        assert_eq!(lock.reader_count(&key()).await.unwrap(), 2);
        assert!(!lock.try_write(&key(), &w, TTL).await.unwrap());

        assert!(lock.release_read(&key(), &r1).await.unwrap());
        assert!(!lock.try_write(&key(), &w, TTL).await.unwrap());
        assert!(lock.release_read(&key(), &r2).await.unwrap());
        assert!(lock.try_write(&key(), &w, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_writer_excludes_readers_and_writers() {
        let lock = rwlock(false);
        let (w1, w2, r) = (LockToken::generate(), LockToken::generate(), LockToken::generate());

        assert!(lock.try_write(&key(), &w1, TTL).await.unwrap());
        assert!(!lock.try_write(&key(), &w2, TTL).await.unwrap());
        assert!(!lock.try_read(&key(), &r, TTL).await.unwrap());
        assert_eq!(lock.reader_count(&key()).await.unwrap(), 0);

        assert!(!lock.release_write(&key(), &w2).await.unwrap());
        assert!(lock.release_write(&key(), &w1).await.unwrap());
        assert!(lock.try_read(&key(), &r, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_waiting_writer_blocks_new_readers() {
        let lock = rwlock(true);
        let (r1, r2, w) = (LockToken::generate(), LockToken::generate(), LockToken::generate());

        assert!(lock.try_read(&key(), &r1, TTL).await.unwrap());
        assert!(!lock.try_write(&key(), &w, TTL).await.unwrap());
        lock.mark_writer_waiting(&key(), &w, TTL).await.unwrap();

        assert!(!lock.try_read(&key(), &r2, TTL).await.unwrap());

        lock.release_read(&key(), &r1).await.unwrap();
        assert!(lock.try_write(&key(), &w, TTL).await.unwrap());
        lock.clear_writer_waiting(&key(), &w).await;
        lock.release_write(&key(), &w).await.unwrap();
        assert!(lock.try_read(&key(), &r2, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_double_release_of_reader_is_rejected() {
        let lock = rwlock(false);
        let (r1, r2) = (LockToken::generate(), LockToken::generate());
        assert!(lock.try_read(&key(), &r1, TTL).await.unwrap());
        assert!(lock.try_read(&key(), &r2, TTL).await.unwrap());

        assert!(lock.release_read(&key(), &r1).await.unwrap());
        assert!(!lock.release_read(&key(), &r1).await.unwrap());
        assert_eq!(lock.reader_count(&key()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_reader_expires_under_reader_churn() {
        let lock = rwlock(false);
        let short = Duration::from_millis(200);
        let abandoned = LockToken::generate();
        let (busy, w) = (LockToken::generate(), LockToken::generate());

        assert!(lock.try_read(&key(), &abandoned, short).await.unwrap());
        for _ in 0..10 {
            assert!(lock.try_read(&key(), &busy, short).await.unwrap());
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(lock.release_read(&key(), &busy).await.unwrap());
        }

        assert_eq!(lock.reader_count(&key()).await.unwrap(), 0);
        assert!(!lock.read_held_by(&key(), &abandoned).await.unwrap());
        assert!(!lock.release_read(&key(), &abandoned).await.unwrap());
        assert!(lock.try_write(&key(), &w, TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_reader_keeps_writer_out() {
        let lock = rwlock(false);
        let short = Duration::from_millis(200);
        let (r, w) = (LockToken::generate(), LockToken::generate());

        assert!(lock.try_read(&key(), &r, short).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(lock.renew_read(&key(), &r, short).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(lock.read_held_by(&key(), &r).await.unwrap());
        assert!(!lock.try_write(&key(), &w, TTL).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!lock.renew_read(&key(), &r, short).await.unwrap());
        assert!(lock.try_write(&key(), &w, TTL).await.unwrap());
    }
}
