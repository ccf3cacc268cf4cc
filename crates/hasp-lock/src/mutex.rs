//! Mutual-exclusion lock
//!
//! One lease per key, holding the token of the current owner. Reentrancy,
//! watchdog renewal and the blocking loop are shared with the other lock
//! types and live in `context`.

use std::time::Duration;

use hasp_common::{KeySpace, LockKey, LockToken, Result};
use hasp_store::RetryingStore;

pub struct MutexLock {
    store: RetryingStore,
    keys: KeySpace,
}

impl MutexLock {
    pub fn new(store: RetryingStore, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub async fn try_acquire(
        &self,
        key: &LockKey,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool> {
        self.store
            .try_acquire(&self.keys.exclusive(key), token.as_str(), ttl)
            .await
    }

    pub async fn release(&self, key: &LockKey, token: &LockToken) -> Result<bool> {
        self.store
            .release(&self.keys.exclusive(key), token.as_str())
            .await
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use hasp_store::{MemoryLeaseStore, RetryPolicy};
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(5);

    fn mutex() -> (Arc<MemoryLeaseStore>, MutexLock) {
        let memory = Arc::new(MemoryLeaseStore::new());
        let store = RetryingStore::new(memory.clone(), RetryPolicy::no_retry());
        (memory, MutexLock::new(store, KeySpace::default()))
    }

    #[tokio::test]
    async fn test_second_token_is_rejected() {
        let (_, lock) = mutex();
        let key = LockKey::new("order", "42").unwrap();
        let (t1, t2) = (LockToken::generate(), LockToken::generate());

        assert!(lock.try_acquire(&key, &t1, TTL).await.unwrap());
        assert!(!lock.try_acquire(&key, &t2, TTL).await.unwrap());
        assert!(!lock.release(&key, &t2).await.unwrap());
        assert!(!lock.renew(&key, &t2, TTL).await.unwrap());
        assert!(lock.is_held_by(&key, &t1).await.unwrap());

        assert!(lock.release(&key, &t1).await.unwrap());
        assert!(lock.try_acquire(&key, &t2, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_new_lease() {
        let (memory, lock) = mutex();
        let key = LockKey::new("order", "42").unwrap();
        let (stale, fresh) = (LockToken::generate(), LockToken::generate());

        assert!(lock.try_acquire(&key, &stale, TTL).await.unwrap());
        memory.expire_now(&KeySpace::default().exclusive(&key));
        assert!(lock.try_acquire(&key, &fresh, TTL).await.unwrap());

        assert!(!lock.release(&key, &stale).await.unwrap());
        assert!(!lock.renew(&key, &stale, TTL).await.unwrap());
        assert!(lock.is_held_by(&key, &fresh).await.unwrap());
    }
}
