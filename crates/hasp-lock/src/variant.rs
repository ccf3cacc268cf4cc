// Lock variants behind one interface
// The manager selects a variant by `LockType`; each variant keeps its own
// store protocol and the shared acquire loop only sees this interface.

use std::time::Duration;

use hasp_common::{KeySpace, LockConfig, LockKey, LockToken, LockType, Result, WaiterId};
use hasp_store::RetryingStore;

use crate::fair::FairLock;
use crate::mutex::MutexLock;
use crate::rwlock::ReadWriteLock;

/// One instance of every lock implementation, bound to a store
pub struct LockSet {
    mutex: MutexLock,
    rw: ReadWriteLock,
    fair: FairLock,
}

impl LockSet {
    pub fn new(store: RetryingStore, keys: KeySpace, config: &LockConfig) -> Self {
        Self {
            mutex: MutexLock::new(store.clone(), keys.clone()),
            rw: ReadWriteLock::new(store.clone(), keys.clone(), config.writer_priority),
            fair: FairLock::new(store, keys, config.fair_queue_entry_grace()),
        }
    }

    pub fn variant(&self, lock_type: LockType) -> LockVariant<'_> {
        match lock_type {
            LockType::Exclusive => LockVariant::Exclusive(&self.mutex),
            LockType::Read => LockVariant::Read(&self.rw),
            LockType::Write => LockVariant::Write(&self.rw),
            LockType::Fair => LockVariant::Fair(&self.fair),
        }
    }

    pub fn fair(&self) -> &FairLock {
        &self.fair
    }
}

pub enum LockVariant<'a> {
    Exclusive(&'a MutexLock),
    Read(&'a ReadWriteLock),
    Write(&'a ReadWriteLock),
    Fair(&'a FairLock),
}

impl LockVariant<'_> {
    pub async fn try_acquire(
        &self,
        requester: &WaiterId,
        key: &LockKey,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool> {
        match self {
            LockVariant::Exclusive(lock) => lock.try_acquire(key, token, ttl).await,
            LockVariant::Read(lock) => lock.try_read(key, token, ttl).await,
            LockVariant::Write(lock) => lock.try_write(key, token, ttl).await,
            LockVariant::Fair(lock) => lock.try_acquire(requester, key, token, ttl).await,
        }
    }

    pub async fn release(&self, key: &LockKey, token: &LockToken) -> Result<bool> {
        match self {
            LockVariant::Exclusive(lock) => lock.release(key, token).await,
            LockVariant::Read(lock) => lock.release_read(key, token).await,
            LockVariant::Write(lock) => lock.release_write(key, token).await,
            LockVariant::Fair(lock) => lock.release(key, token).await,
        }
    }

    pub async fn renew(&self, key: &LockKey, token: &LockToken, ttl: Duration) -> Result<bool> {
        match self {
            LockVariant::Exclusive(lock) => lock.renew(key, token, ttl).await,
            LockVariant::Read(lock) => lock.renew_read(key, token, ttl).await,
            LockVariant::Write(lock) => lock.renew_write(key, token, ttl).await,
            LockVariant::Fair(lock) => lock.renew(key, token, ttl).await,
        }
    }

    /// Whether the lease issued under `token` is still live
    pub async fn is_held_by(&self, key: &LockKey, token: &LockToken) -> Result<bool> {
        match self {
            LockVariant::Exclusive(lock) => lock.is_held_by(key, token).await,
            LockVariant::Read(lock) => lock.read_held_by(key, token).await,
            LockVariant::Write(lock) => lock.write_held_by(key, token).await,
            LockVariant::Fair(lock) => lock.is_held_by(key, token).await,
        }
    }

    /// Called on every failed poll of a blocking acquire
    pub async fn on_wait(
        &self,
        key: &LockKey,
        token: &LockToken,
        remaining: Duration,
    ) -> Result<()> {
        match self {
            LockVariant::Write(lock) => lock.mark_writer_waiting(key, token, remaining).await,
            _ => Ok(()),
        }
    }

    /// Called once when a blocking acquire that had to wait returns
    pub async fn end_wait(
        &self,
        requester: &WaiterId,
        key: &LockKey,
        token: &LockToken,
        acquired: bool,
    ) {
        match self {
            LockVariant::Write(lock) => lock.clear_writer_waiting(key, token).await,
            LockVariant::Fair(lock) if !acquired => lock.leave_queue(requester, key).await,
            _ => {}
        }
    }
}
