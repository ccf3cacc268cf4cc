//! Lease watchdog
//!
//! A periodic renewal task bound to one held lease. It renews at a third of
//! the TTL and stops on `stop()`, on drop, or as soon as a renewal reports a
//! token mismatch, so a lease that changed hands is never extended.

use std::sync::Arc;
use std::time::Duration;

use hasp_common::{LockKey, LockToken, LockType};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, warn};

use crate::monitor::PerformanceMonitor;
use crate::variant::LockSet;

pub struct Watchdog {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    pub fn spawn(
        runtime: &Handle,
        locks: Arc<LockSet>,
        monitor: Arc<PerformanceMonitor>,
        lock_type: LockType,
        key: LockKey,
        token: LockToken,
        ttl: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let period = (ttl / 3).max(Duration::from_millis(1));
        let handle = runtime.spawn(run(
            locks, monitor, lock_type, key, token, ttl, period, stop_rx,
        ));
        Self { stop_tx, handle }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    locks: Arc<LockSet>,
    monitor: Arc<PerformanceMonitor>,
    lock_type: LockType,
    key: LockKey,
    token: LockToken,
    ttl: Duration,
    period: Duration,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    debug!(
        key = %key,
        lock_type = %lock_type,
        period_ms = period.as_millis() as u64,
        "Watchdog started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match locks.variant(lock_type).renew(&key, &token, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            key = %key,
                            lock_type = %lock_type,
                            "Lease no longer held by this token, watchdog stopping"
                        );
                        monitor.record_lost_lease(lock_type);
                        break;
                    }
                    Err(e) => {
                        // lease may still be live: keep trying until it expires
                        warn!(key = %key, lock_type = %lock_type, "Lease renewal failed: {}", e);
                    }
                }
            }
            _ = stop_rx.recv() => {
                break;
            }
        }
    }
    debug!(key = %key, lock_type = %lock_type, "Watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use hasp_common::{KeySpace, LockConfig};
    use hasp_store::{LeaseStore, MemoryLeaseStore, RetryPolicy, RetryingStore};

    fn setup() -> (Arc<MemoryLeaseStore>, Arc<LockSet>, Arc<PerformanceMonitor>) {
        let memory = Arc::new(MemoryLeaseStore::new());
        let store = RetryingStore::new(memory.clone(), RetryPolicy::no_retry());
        let locks = Arc::new(LockSet::new(store, KeySpace::default(), &LockConfig::default()));
        (memory, locks, Arc::new(PerformanceMonitor::new(Duration::from_secs(1))))
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_past_original_ttl() {
        let (memory, locks, monitor) = setup();
        let key = LockKey::new("job", "1").unwrap();
        let token = LockToken::generate();
        let ttl = Duration::from_millis(300);
        let lease_key = KeySpace::default().exclusive(&key);

        assert!(memory.try_acquire(&lease_key, token.as_str(), ttl).await.unwrap());
        let watchdog = Watchdog::spawn(
            &Handle::current(),
            locks,
            monitor.clone(),
            LockType::Exclusive,
            key,
            token.clone(),
            ttl,
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            memory.current_token(&lease_key).await.unwrap().as_deref(),
            Some(token.as_str())
        );
        assert!(!watchdog.is_finished());

        watchdog.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(memory.current_token(&lease_key).await.unwrap(), None);
        assert_eq!(monitor.snapshot().lost_leases, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_takeover() {
        let (memory, locks, monitor) = setup();
        let key = LockKey::new("job", "2").unwrap();
        let token = LockToken::generate();
        let ttl = Duration::from_millis(300);
        let lease_key = KeySpace::default().exclusive(&key);

        assert!(memory.try_acquire(&lease_key, token.as_str(), ttl).await.unwrap());
        let watchdog = Watchdog::spawn(
            &Handle::current(),
            locks,
            monitor.clone(),
            LockType::Exclusive,
            key,
            token,
            ttl,
        );

        memory.expire_now(&lease_key);
        assert!(memory.try_acquire(&lease_key, "other", Duration::from_secs(60)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(watchdog.is_finished());
        assert_eq!(monitor.snapshot().lost_leases, 1);
        assert_eq!(
            memory.current_token(&lease_key).await.unwrap().as_deref(),
            Some("other")
        );
    }
}
