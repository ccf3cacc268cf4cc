//! Engine context
//!
//! Everything a lock operation touches besides the caller's arguments:
//! store, key space, lock variants, reentrancy table, local deadlock
//! detector and monitor. The manager creates one on first use and drops it
//! when idle, so separate managers never share state.

use std::sync::Arc;
use std::time::Duration;

use hasp_common::{
    Backoff, KeySpace, LockConfig, LockError, LockKey, LockToken, LockType, Result, WaiterId,
};
use hasp_store::RetryingStore;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::detector::LocalDeadlockDetector;
use crate::monitor::PerformanceMonitor;
use crate::reentrant::{Exit, Hold, HoldKey, HoldTable};
use crate::variant::LockSet;
use crate::watchdog::Watchdog;

pub struct EngineContext {
    pub(crate) node_id: String,
    pub(crate) config: LockConfig,
    pub(crate) keys: KeySpace,
    pub(crate) store: RetryingStore,
    pub(crate) locks: Arc<LockSet>,
    pub(crate) holds: HoldTable,
    pub(crate) detector: LocalDeadlockDetector,
    pub(crate) monitor: Arc<PerformanceMonitor>,
    pub(crate) runtime: Handle,
}

impl EngineContext {
    pub fn new(
        node_id: String,
        config: LockConfig,
        store: RetryingStore,
        monitor: Arc<PerformanceMonitor>,
        runtime: Handle,
    ) -> Self {
        let keys = KeySpace::new(config.namespace.clone());
        let locks = Arc::new(LockSet::new(store.clone(), keys.clone(), &config));
        let detector = LocalDeadlockDetector::with_writer_priority(config.writer_priority);
        Self {
            node_id,
            config,
            keys,
            store,
            locks,
            holds: HoldTable::new(),
            detector,
            monitor,
            runtime,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn detector(&self) -> &LocalDeadlockDetector {
        &self.detector
    }

    /// No held leases and no blocked acquires
    pub fn is_idle(&self) -> bool {
        self.holds.is_empty() && !self.detector.has_waits()
    }

    /// Single attempt. `Ok(None)` when the lock is taken by someone else.
    pub async fn try_lock(
        self: &Arc<Self>,
        holder: &WaiterId,
        lock_type: LockType,
        key: &LockKey,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        self.monitor.record_attempt(lock_type);
        let hold_key = HoldKey::new(holder, lock_type, key);
        if let Some(token) = self.holds.reenter(&hold_key) {
            self.monitor.record_reentry();
            return Ok(Some(token));
        }

        let token = LockToken::generate();
        match self
            .locks
            .variant(lock_type)
            .try_acquire(holder, key, &token, ttl)
            .await
        {
            Ok(true) => {
                self.on_acquired(hold_key, token.clone(), ttl, Duration::ZERO, false);
                Ok(Some(token))
            }
            Ok(false) => {
                self.monitor.record_contended(lock_type);
                debug!(owner = %holder, key = %key, lock_type = %lock_type, "Lock busy");
                Ok(None)
            }
            Err(e) => {
                self.monitor.record_failure(lock_type, &e);
                Err(e)
            }
        }
    }

    /// Poll with backoff until acquired, `max_wait` elapses, or a deadlock
    /// involving `holder` is found.
    pub async fn lock(
        self: &Arc<Self>,
        holder: &WaiterId,
        lock_type: LockType,
        key: &LockKey,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<LockToken> {
        self.monitor.record_attempt(lock_type);
        let hold_key = HoldKey::new(holder, lock_type, key);
        if let Some(token) = self.holds.reenter(&hold_key) {
            self.monitor.record_reentry();
            return Ok(token);
        }

        let variant = self.locks.variant(lock_type);
        let lease_key = self.keys.lease_key(lock_type, key);
        let graph_key = self.keys.graph_key(lock_type, key);
        let token = LockToken::generate();
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut backoff = Backoff::new(self.config.initial_backoff(), self.config.max_backoff());
        let mut guard: Option<WaitGuard> = None;

        // Ok(None): our token was granted; Ok(Some): reentered a hold taken
        // concurrently by the same client
        let outcome: Result<Option<LockToken>> = loop {
            // a victim chosen elsewhere has lost its other leases already
            if let Some(cycle) = self.detector.take_abort(holder) {
                break Err(LockError::DeadlockDetected {
                    key: lease_key.clone(),
                    cycle,
                });
            }
            match variant.try_acquire(holder, key, &token, ttl).await {
                Ok(true) => break Ok(None),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
            if let Some(existing) = self.holds.reenter(&hold_key) {
                break Ok(Some(existing));
            }

            if guard.is_none() {
                guard = Some(WaitGuard::new(
                    self.clone(),
                    holder,
                    lock_type,
                    key,
                    &token,
                    &graph_key,
                ));
            }
            if let Err(cycle) = self.detector.register_wait(holder, &graph_key, lock_type) {
                self.monitor.record_deadlock("local");
                break Err(LockError::DeadlockDetected {
                    key: lease_key.clone(),
                    cycle,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                break Err(LockError::LockTimeout {
                    key: lease_key.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            if let Err(e) = variant.on_wait(key, &token, deadline - now).await {
                break Err(e);
            }
            tokio::time::sleep(backoff.next_delay().min(deadline - now)).await;
        };

        let contended = guard.is_some();
        if let Some(guard) = guard {
            guard.finish(matches!(outcome, Ok(None))).await;
        }

        match outcome {
            Ok(None) => {
                self.on_acquired(hold_key, token.clone(), ttl, started.elapsed(), contended);
                Ok(token)
            }
            Ok(Some(existing)) => {
                self.monitor.record_reentry();
                Ok(existing)
            }
            Err(e) => {
                self.monitor.record_failure(lock_type, &e);
                debug!(owner = %holder, key = %lease_key, "Lock acquisition failed: {}", e);
                Err(e)
            }
        }
    }

    fn on_acquired(
        self: &Arc<Self>,
        hold_key: HoldKey,
        token: LockToken,
        ttl: Duration,
        waited: Duration,
        contended: bool,
    ) {
        let lock_type = hold_key.lock_type;
        let watchdog = (ttl <= self.config.renewal_threshold()).then(|| {
            Watchdog::spawn(
                &self.runtime,
                self.locks.clone(),
                self.monitor.clone(),
                lock_type,
                hold_key.resource.clone(),
                token.clone(),
                ttl,
            )
        });

        let graph_key = self.keys.graph_key(lock_type, &hold_key.resource);
        self.detector.record_hold(
            &hold_key.holder,
            &graph_key,
            lock_type,
            &hold_key.resource,
            token.as_str(),
        );
        let lease_key = self.keys.lease_key(lock_type, &hold_key.resource);
        self.monitor.record_acquired(lock_type, &lease_key, waited, contended);
        debug!(
            owner = %hold_key.holder,
            key = %lease_key,
            ttl_ms = ttl.as_millis() as u64,
            watchdog = watchdog.is_some(),
            "Lock acquired"
        );
        self.holds.insert(hold_key, Hold::new(token, ttl, watchdog));
    }

    /// Undo one acquisition. Returns false when the token no longer owns the
    /// lease; that is logged and otherwise ignored.
    pub async fn unlock(
        &self,
        holder: &WaiterId,
        lock_type: LockType,
        key: &LockKey,
        token: &LockToken,
    ) -> Result<bool> {
        let hold_key = HoldKey::new(holder, lock_type, key);
        let lease_key = self.keys.lease_key(lock_type, key);

        match self.holds.exit(&hold_key, token) {
            Exit::Nested(remaining) => {
                debug!(owner = %holder, key = %lease_key, remaining, "Reentrant unlock");
                Ok(true)
            }
            Exit::TokenMismatch => {
                warn!("{}", LockError::LockTokenMismatch { key: lease_key });
                Ok(false)
            }
            Exit::Released(mut hold) => {
                hold.stop_watchdog();
                self.detector
                    .clear_hold(holder, &self.keys.graph_key(lock_type, key));
                self.monitor
                    .record_released(lock_type, hold.acquired_at.elapsed());
                self.release_lease(lock_type, key, token, &lease_key).await
            }
            Exit::NotHeld => self.release_lease(lock_type, key, token, &lease_key).await,
        }
    }

    async fn release_lease(
        &self,
        lock_type: LockType,
        key: &LockKey,
        token: &LockToken,
        lease_key: &str,
    ) -> Result<bool> {
        let released = self.locks.variant(lock_type).release(key, token).await?;
        if released {
            debug!(key = %lease_key, "Lock released");
        } else {
            warn!(
                "{}, lease already expired or taken over",
                LockError::LockTokenMismatch {
                    key: lease_key.to_string()
                }
            );
        }
        Ok(released)
    }

    /// Extend a held lease. A token that no longer owns it is an error here,
    /// unlike `unlock`.
    pub async fn renew(
        &self,
        lock_type: LockType,
        key: &LockKey,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<()> {
        if self.locks.variant(lock_type).renew(key, token, ttl).await? {
            Ok(())
        } else {
            Err(LockError::LockTokenMismatch {
                key: self.keys.lease_key(lock_type, key),
            })
        }
    }

    /// Drop local holds whose lease is gone from the store (expired, forced
    /// release, deadlock recovery) so they stop contributing graph edges.
    pub async fn validate_holds(&self) -> Result<usize> {
        let mut dropped = 0;
        for (hold_key, token) in self.holds.entries() {
            let held = self
                .locks
                .variant(hold_key.lock_type)
                .is_held_by(&hold_key.resource, &token)
                .await?;
            if held {
                continue;
            }
            if let Some(mut hold) = self.holds.remove_if_token(&hold_key, &token) {
                hold.stop_watchdog();
                let graph_key = self.keys.graph_key(hold_key.lock_type, &hold_key.resource);
                self.detector.clear_hold(&hold_key.holder, &graph_key);
                self.monitor
                    .record_released(hold_key.lock_type, hold.acquired_at.elapsed());
                warn!(
                    owner = %hold_key.holder,
                    key = %self.keys.lease_key(hold_key.lock_type, &hold_key.resource),
                    "Held lease disappeared from the store, dropping local hold"
                );
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// Stop every watchdog and forget all in-memory state. Leases stay in the
    /// store until released or expired.
    pub fn teardown(&self) {
        let holds = self.holds.drain();
        if !holds.is_empty() {
            info!(count = holds.len(), "Dropping local holds without releasing leases");
        }
        for (_, mut hold) in holds {
            hold.stop_watchdog();
        }
        self.detector.clear();
    }
}

/// Cleanup for a blocked acquire: clears the wait edge, any pending abort
/// and the variant's waiting state on every exit path, including the
/// future being dropped.
struct WaitGuard {
    ctx: Arc<EngineContext>,
    holder: WaiterId,
    lock_type: LockType,
    key: LockKey,
    token: LockToken,
    graph_key: String,
    armed: bool,
}

impl WaitGuard {
    fn new(
        ctx: Arc<EngineContext>,
        holder: &WaiterId,
        lock_type: LockType,
        key: &LockKey,
        token: &LockToken,
        graph_key: &str,
    ) -> Self {
        Self {
            ctx,
            holder: holder.clone(),
            lock_type,
            key: key.clone(),
            token: token.clone(),
            graph_key: graph_key.to_string(),
            armed: true,
        }
    }

    async fn finish(mut self, acquired: bool) {
        self.armed = false;
        self.ctx.detector.clear_wait(&self.holder, &self.graph_key);
        self.ctx.detector.take_abort(&self.holder);
        self.ctx
            .locks
            .variant(self.lock_type)
            .end_wait(&self.holder, &self.key, &self.token, acquired)
            .await;
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.ctx.detector.clear_wait(&self.holder, &self.graph_key);
        self.ctx.detector.take_abort(&self.holder);

        let ctx = self.ctx.clone();
        let holder = self.holder.clone();
        let lock_type = self.lock_type;
        let key = self.key.clone();
        let token = self.token.clone();
        self.ctx.runtime.spawn(async move {
            ctx.locks
                .variant(lock_type)
                .end_wait(&holder, &key, &token, false)
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hasp_store::{LeaseStore, MemoryLeaseStore, RetryPolicy};

    const TTL: Duration = Duration::from_secs(5);

    fn context(config: LockConfig) -> (Arc<MemoryLeaseStore>, Arc<EngineContext>) {
        let memory = Arc::new(MemoryLeaseStore::new());
        let store = RetryingStore::new(memory.clone(), RetryPolicy::no_retry());
        let monitor = Arc::new(PerformanceMonitor::new(config.slow_lock_threshold()));
        let ctx = EngineContext::new("node-1".into(), config, store, monitor, Handle::current());
        (memory, Arc::new(ctx))
    }

    fn fast_config() -> LockConfig {
        LockConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reentrant_lock_releases_on_outer_unlock() {
        let (memory, ctx) = context(fast_config());
        let me = WaiterId::new("node-1", "c1");
        let key = LockKey::new("order", "42").unwrap();
        let lease_key = ctx.keys.exclusive(&key);

        let token = ctx.try_lock(&me, LockType::Exclusive, &key, TTL).await.unwrap().unwrap();
        let again = ctx
            .lock(&me, LockType::Exclusive, &key, TTL, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(token, again);

        assert!(ctx.unlock(&me, LockType::Exclusive, &key, &token).await.unwrap());
        assert!(memory.current_token(&lease_key).await.unwrap().is_some());
        assert!(ctx.unlock(&me, LockType::Exclusive, &key, &token).await.unwrap());
        assert!(memory.current_token(&lease_key).await.unwrap().is_none());
        assert!(ctx.is_idle());
    }

    #[tokio::test]
    async fn test_blocking_lock_times_out_and_clears_wait() {
        let (_, ctx) = context(fast_config());
        let (a, b) = (WaiterId::new("node-1", "a"), WaiterId::new("node-1", "b"));
        let key = LockKey::new("order", "42").unwrap();

        ctx.try_lock(&a, LockType::Exclusive, &key, TTL).await.unwrap().unwrap();
        let err = ctx
            .lock(&b, LockType::Exclusive, &key, TTL, Duration::from_millis(30))
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::LockTimeout { .. }));
        assert!(!ctx.detector.has_waits());
        assert_eq!(ctx.monitor.snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn test_unlock_with_stale_token_is_no_op() {
        let (_, ctx) = context(fast_config());
        let me = WaiterId::new("node-1", "c1");
        let key = LockKey::new("order", "42").unwrap();

        let token = ctx.try_lock(&me, LockType::Exclusive, &key, TTL).await.unwrap().unwrap();
        assert!(
            !ctx.unlock(&me, LockType::Exclusive, &key, &LockToken::generate())
                .await
                .unwrap()
        );
        assert_eq!(
            ctx.renew(LockType::Exclusive, &key, &LockToken::generate(), TTL).await,
            Err(LockError::LockTokenMismatch {
                key: ctx.keys.exclusive(&key)
            })
        );
        assert!(ctx.renew(LockType::Exclusive, &key, &token, TTL).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_to_write_upgrade_is_a_deadlock() {
        let (_, ctx) = context(fast_config());
        let me = WaiterId::new("node-1", "c1");
        let key = LockKey::new("doc", "1").unwrap();

        ctx.try_lock(&me, LockType::Read, &key, TTL).await.unwrap().unwrap();
        let err = ctx
            .lock(&me, LockType::Write, &key, TTL, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err.deadlock_cycle(), Some(&[me][..]));
    }

    #[tokio::test]
    async fn test_validate_drops_lost_holds() {
        let (memory, ctx) = context(fast_config());
        let me = WaiterId::new("node-1", "c1");
        let key = LockKey::new("order", "42").unwrap();

        ctx.try_lock(&me, LockType::Exclusive, &key, TTL).await.unwrap().unwrap();
        memory.expire_now(&ctx.keys.exclusive(&key));

        assert_eq!(ctx.validate_holds().await.unwrap(), 1);
        assert!(ctx.is_idle());
    }

    #[tokio::test]
    async fn test_dropped_fair_waiter_leaves_queue() {
        let (memory, ctx) = context(fast_config());
        let (a, b) = (WaiterId::new("node-1", "a"), WaiterId::new("node-1", "b"));
        let key = LockKey::new("ticket", "9").unwrap();
        let queue = ctx.keys.fair_queue(&key);

        ctx.try_lock(&a, LockType::Fair, &key, TTL).await.unwrap().unwrap();
        let waiting = tokio::time::timeout(
            Duration::from_millis(50),
            ctx.lock(&b, LockType::Fair, &key, TTL, Duration::from_secs(10)),
        )
        .await;
        assert!(waiting.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(memory.queue_len(&queue).await.unwrap(), 0);
        assert!(!ctx.detector.has_waits());
    }
}
