// Lock performance monitor
// Lock-free counters for the diagnostics snapshot, mirrored to the
// `metrics` facade for whatever exporter the application installs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use hasp_common::{LockError, LockType};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{info, warn};

static DESCRIBE: Once = Once::new();

/// Register metric descriptions. Safe to call more than once.
pub fn describe_metrics() {
    DESCRIBE.call_once(|| {
        describe_counter!(
            "hasp_lock_attempts_total",
            "Total number of lock acquisition attempts"
        );
        describe_counter!(
            "hasp_lock_failures_total",
            "Total number of failed lock acquisitions"
        );
        describe_histogram!(
            "hasp_lock_wait_seconds",
            "Time spent waiting for a lock in seconds"
        );
        describe_histogram!("hasp_lock_hold_seconds", "Time a lock was held in seconds");
        describe_counter!("hasp_deadlocks_total", "Total number of detected deadlocks");
        describe_counter!(
            "hasp_lost_leases_total",
            "Total number of leases lost while held"
        );
        describe_gauge!("hasp_active_locks", "Number of locks currently held");
    });
}

/// Point-in-time view of the monitor counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub contended: u64,
    pub reentries: u64,
    pub releases: u64,
    pub deadlocks: u64,
    pub lost_leases: u64,
    pub active_locks: u64,
    pub avg_wait_ms: f64,
    pub avg_hold_ms: f64,
    pub slow_locks: u64,
    /// Share of successful acquisitions slower than the slow-lock threshold
    pub slow_lock_rate: f64,
}

pub struct PerformanceMonitor {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    contended: AtomicU64,
    reentries: AtomicU64,
    releases: AtomicU64,
    deadlocks: AtomicU64,
    lost_leases: AtomicU64,
    active: AtomicU64,
    total_wait_ms: AtomicU64,
    total_hold_ms: AtomicU64,
    slow_locks: AtomicU64,
    slow_threshold: Duration,
}

impl PerformanceMonitor {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            reentries: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            deadlocks: AtomicU64::new(0),
            lost_leases: AtomicU64::new(0),
            active: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
            total_hold_ms: AtomicU64::new(0),
            slow_locks: AtomicU64::new(0),
            slow_threshold,
        }
    }

    pub fn record_attempt(&self, lock_type: LockType) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        counter!("hasp_lock_attempts_total", "type" => lock_type.as_str()).increment(1);
    }

    /// A fresh lease was granted after `wait`
    pub fn record_acquired(&self, lock_type: LockType, key: &str, wait: Duration, contended: bool) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms
            .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
        if contended {
            self.contended.fetch_add(1, Ordering::Relaxed);
        }
        if wait >= self.slow_threshold {
            self.slow_locks.fetch_add(1, Ordering::Relaxed);
            warn!(
                key = %key,
                lock_type = %lock_type,
                wait_ms = wait.as_millis() as u64,
                "Slow lock acquisition"
            );
        }

        histogram!("hasp_lock_wait_seconds", "type" => lock_type.as_str())
            .record(wait.as_secs_f64());
        gauge!("hasp_active_locks").increment(1.0);
    }

    pub fn record_reentry(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.reentries.fetch_add(1, Ordering::Relaxed);
    }

    /// A non-blocking attempt found the lock taken
    pub fn record_contended(&self, lock_type: LockType) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.contended.fetch_add(1, Ordering::Relaxed);
        counter!("hasp_lock_failures_total", "type" => lock_type.as_str(), "reason" => "contended")
            .increment(1);
    }

    pub fn record_failure(&self, lock_type: LockType, err: &LockError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let reason = match err {
            LockError::LockTimeout { .. } => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                "timeout"
            }
            LockError::DeadlockDetected { .. } => "deadlock",
            LockError::StoreUnavailable(_) | LockError::LockUnavailable { .. } => "unavailable",
            _ => "other",
        };
        counter!("hasp_lock_failures_total", "type" => lock_type.as_str(), "reason" => reason)
            .increment(1);
    }

    pub fn record_released(&self, lock_type: LockType, held: Duration) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.total_hold_ms
            .fetch_add(held.as_millis() as u64, Ordering::Relaxed);
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));

        histogram!("hasp_lock_hold_seconds", "type" => lock_type.as_str())
            .record(held.as_secs_f64());
        gauge!("hasp_active_locks").decrement(1.0);
    }

    pub fn record_deadlock(&self, scope: &'static str) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
        counter!("hasp_deadlocks_total", "scope" => scope).increment(1);
    }

    pub fn record_lost_lease(&self, lock_type: LockType) {
        self.lost_leases.fetch_add(1, Ordering::Relaxed);
        counter!("hasp_lost_leases_total", "type" => lock_type.as_str()).increment(1);
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let successes = self.successes.load(Ordering::Relaxed);
        let reentries = self.reentries.load(Ordering::Relaxed);
        let granted = successes.saturating_sub(reentries);
        let releases = self.releases.load(Ordering::Relaxed);
        let slow_locks = self.slow_locks.load(Ordering::Relaxed);

        PerformanceSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            reentries,
            releases,
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            lost_leases: self.lost_leases.load(Ordering::Relaxed),
            active_locks: self.active.load(Ordering::Relaxed),
            avg_wait_ms: average(self.total_wait_ms.load(Ordering::Relaxed), granted),
            avg_hold_ms: average(self.total_hold_ms.load(Ordering::Relaxed), releases),
            slow_locks,
            slow_lock_rate: if granted == 0 {
                0.0
            } else {
                slow_locks as f64 / granted as f64
            },
        }
    }

    /// Log a one-line summary of the current snapshot
    pub fn report(&self) {
        let s = self.snapshot();
        info!(
            attempts = s.attempts,
            successes = s.successes,
            failures = s.failures,
            timeouts = s.timeouts,
            deadlocks = s.deadlocks,
            active = s.active_locks,
            avg_wait_ms = s.avg_wait_ms,
            avg_hold_ms = s.avg_hold_ms,
            slow_lock_rate = s.slow_lock_rate,
            "Lock performance"
        );
    }
}

/// Log the snapshot every `period` until `shutdown` flips
pub fn spawn_reporter(
    monitor: Arc<PerformanceMonitor>,
    runtime: &Handle,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        let mut last_attempts = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let attempts = monitor.attempts.load(Ordering::Relaxed);
                    if attempts != last_attempts {
                        monitor.report();
                        last_attempts = attempts;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn average(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_averages() {
        let monitor = PerformanceMonitor::new(Duration::from_millis(100));
        monitor.record_attempt(LockType::Exclusive);
        monitor.record_acquired(LockType::Exclusive, "k", Duration::from_millis(20), false);
        monitor.record_attempt(LockType::Exclusive);
        monitor.record_acquired(LockType::Exclusive, "k", Duration::from_millis(180), true);
        monitor.record_released(LockType::Exclusive, Duration::from_millis(50));

        let s = monitor.snapshot();
        assert_eq!(s.attempts, 2);
        assert_eq!(s.successes, 2);
        assert_eq!(s.active_locks, 1);
        assert_eq!(s.avg_wait_ms, 100.0);
        assert_eq!(s.avg_hold_ms, 50.0);
        assert_eq!(s.slow_locks, 1);
        assert_eq!(s.slow_lock_rate, 0.5);
        assert_eq!(s.contended, 1);
    }

    #[test]
    fn test_failures_by_reason() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(1));
        monitor.record_failure(
            LockType::Fair,
            &LockError::LockTimeout {
                key: "k".into(),
                waited_ms: 10,
            },
        );
        monitor.record_contended(LockType::Fair);
        monitor.record_deadlock("local");

        let s = monitor.snapshot();
        assert_eq!(s.failures, 2);
        assert_eq!(s.timeouts, 1);
        assert_eq!(s.deadlocks, 1);
    }

    #[test]
    fn test_active_gauge_never_underflows() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(1));
        monitor.record_released(LockType::Read, Duration::ZERO);
        assert_eq!(monitor.snapshot().active_locks, 0);
        describe_metrics();
        describe_metrics();
    }
}
