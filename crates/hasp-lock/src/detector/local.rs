// Per-process deadlock detector
// The graph sits behind a parking_lot mutex, never behind a lease from the
// store, so the detector cannot deadlock on the locks it monitors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use hasp_common::{LockKey, LockType, WaiterId, current_timestamp};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::graph::{HeldLease, WaitEdge, WaitForGraph};

/// Local wait-for graph plus pending aborts for blocked waiters
#[derive(Default)]
pub struct LocalDeadlockDetector {
    graph: Mutex<WaitForGraph>,
    aborted: Mutex<HashMap<WaiterId, Vec<WaiterId>>>,
    detections: AtomicU64,
    writer_priority: bool,
}

impl LocalDeadlockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waiting writers gate new readers, so their edges block readers too
    pub fn with_writer_priority(writer_priority: bool) -> Self {
        Self {
            writer_priority,
            ..Self::default()
        }
    }

    /// Register or refresh the wait edge of a blocked acquire and search for
    /// a cycle through it.
    ///
    /// On a cycle the edge stays registered (the caller clears it on exit)
    /// and the participants are returned, starting with `waiter`.
    pub fn register_wait(
        &self,
        waiter: &WaiterId,
        lock_key: &str,
        lock_type: LockType,
    ) -> Result<(), Vec<WaiterId>> {
        let mut graph = self.graph.lock();
        let is_new = graph.add_wait(WaitEdge {
            waiter: waiter.clone(),
            lock_key: lock_key.to_string(),
            lock_type,
            since_ms: current_timestamp(),
            blocks_readers: self.writer_priority && lock_type == LockType::Write,
        });
        if is_new {
            debug!(waiter = %waiter, key = %lock_key, "Wait edge registered");
        }

        match graph.find_cycle_from(waiter) {
            Some(cycle) => {
                drop(graph);
                self.detections.fetch_add(1, Ordering::Relaxed);
                warn!(
                    waiter = %waiter,
                    key = %lock_key,
                    cycle = ?cycle,
                    "Local deadlock detected"
                );
                Err(cycle)
            }
            None => Ok(()),
        }
    }

    pub fn clear_wait(&self, waiter: &WaiterId, lock_key: &str) {
        if self.graph.lock().remove_wait(waiter, lock_key) {
            debug!(waiter = %waiter, key = %lock_key, "Wait edge removed");
        }
    }

    pub fn record_hold(
        &self,
        holder: &WaiterId,
        lock_key: &str,
        lock_type: LockType,
        resource: &LockKey,
        token: &str,
    ) {
        self.graph.lock().add_hold(HeldLease {
            holder: holder.clone(),
            lock_key: lock_key.to_string(),
            lock_type,
            resource: resource.clone(),
            token: token.to_string(),
        });
    }

    pub fn clear_hold(&self, holder: &WaiterId, lock_key: &str) -> Option<HeldLease> {
        self.graph.lock().remove_hold(holder, lock_key)
    }

    /// Full scan over the local graph
    pub fn detect_all(&self) -> Vec<Vec<WaiterId>> {
        self.graph.lock().find_cycles()
    }

    /// Fail the blocked acquire of `waiter` with `DeadlockDetected` on its
    /// next poll. Returns false (and records nothing) when `waiter` is no
    /// longer blocked.
    pub fn abort_waiter(&self, waiter: &WaiterId, cycle: Vec<WaiterId>) -> bool {
        if self.graph.lock().waits_of(waiter).is_empty() {
            debug!(waiter = %waiter, "Deadlock victim no longer waiting");
            return false;
        }
        warn!(waiter = %waiter, cycle = ?cycle, "Aborting deadlock victim");
        self.aborted.lock().insert(waiter.clone(), cycle);
        true
    }

    pub fn take_abort(&self, waiter: &WaiterId) -> Option<Vec<WaiterId>> {
        self.aborted.lock().remove(waiter)
    }

    /// Copy of the current edges and leases for export
    pub fn snapshot(&self) -> (Vec<WaitEdge>, Vec<HeldLease>) {
        let graph = self.graph.lock();
        (graph.wait_edges(), graph.held_leases())
    }

    pub fn held_leases(&self) -> Vec<HeldLease> {
        self.graph.lock().held_leases()
    }

    pub fn has_waits(&self) -> bool {
        self.graph.lock().has_waits()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.lock().is_empty()
    }

    pub fn detections(&self) -> u64 {
        self.detections.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.graph.lock().clear();
        self.aborted.lock().clear();
    }
}
