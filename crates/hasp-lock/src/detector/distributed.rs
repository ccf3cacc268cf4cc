//! Distributed deadlock detector
//!
//! Every node periodically exports its local wait-for state to the store
//! (one hash field per node) and refreshes a heartbeat. On each detection
//! pass the lowest live node id coordinates: it drops nodes whose heartbeat
//! is older than the node timeout, merges the remaining graphs, and breaks
//! each cycle by releasing the leases of the lowest `(node_id, client_id)`
//! participant.
//!
//! State machine per node: `Idle -> Syncing -> Idle` on the sync timer and
//! `Idle -> Detecting -> Idle` on the detection timer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use hasp_common::{KeySpace, LockToken, Result, WaiterId, current_timestamp};
use hasp_store::RetryingStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, interval_at};
use tracing::{debug, error, info, warn};

use super::graph::{HeldLease, WaitEdge, WaitForGraph, select_victim};
use crate::context::EngineContext;
use crate::variant::LockSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorState {
    Idle,
    Syncing,
    Detecting,
}

/// Wait-for state one node exports to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub heartbeat_ms: i64,
    pub waits: Vec<WaitEdge>,
    pub holds: Vec<HeldLease>,
}

/// A cycle broken by releasing the victim's leases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub cycle: Vec<WaiterId>,
    pub victim: WaiterId,
    /// Store keys of the leases that were released
    pub released: Vec<String>,
    pub coordinator: String,
    pub at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub at_ms: i64,
    pub coordinator: String,
    pub live_nodes: Vec<String>,
    pub excised_nodes: Vec<String>,
    pub cycles: Vec<Vec<WaiterId>>,
    pub recoveries: Vec<RecoveryEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorStatus {
    pub enabled: bool,
    pub state: DetectorState,
    pub node_id: String,
    pub live_nodes: Vec<String>,
    pub is_coordinator: bool,
    pub last_sync_ms: Option<i64>,
    pub last_detection: Option<DetectionReport>,
    pub passes: u64,
    pub recoveries: u64,
}

/// Cluster-wide graph assembled from the live nodes' snapshots
#[derive(Debug, Default)]
pub struct ClusterView {
    /// node id -> last heartbeat (Unix millis)
    pub live_nodes: BTreeMap<String, i64>,
    pub stale_nodes: Vec<String>,
    pub graph: WaitForGraph,
}

impl ClusterView {
    /// Lowest live node id
    pub fn coordinator(&self) -> Option<&str> {
        self.live_nodes.keys().next().map(String::as_str)
    }
}

/// Read heartbeats and node snapshots from the store.
///
/// Nodes whose heartbeat is older than `node_timeout` (or missing) never
/// contribute edges; with `excise` their records are also deleted.
pub async fn load_cluster_view(
    store: &RetryingStore,
    keys: &KeySpace,
    node_timeout: Duration,
    now_ms: i64,
    excise: bool,
) -> Result<ClusterView> {
    let heartbeats = store.hash_get_all(&keys.detector_heartbeats()).await?;
    let snapshots = store.hash_get_all(&keys.detector_graph()).await?;
    let timeout_ms = node_timeout.as_millis() as i64;

    let mut view = ClusterView::default();
    for (node, raw) in &heartbeats {
        match raw.parse::<i64>() {
            Ok(at) if now_ms - at <= timeout_ms => {
                view.live_nodes.insert(node.clone(), at);
            }
            _ => view.stale_nodes.push(node.clone()),
        }
    }
    for node in snapshots.keys() {
        if !heartbeats.contains_key(node) {
            view.stale_nodes.push(node.clone());
        }
    }
    view.stale_nodes.sort();
    view.stale_nodes.dedup();

    if excise && !view.stale_nodes.is_empty() {
        excise_nodes(store, keys, &view.stale_nodes).await?;
    }

    for (node, raw) in &snapshots {
        if !view.live_nodes.contains_key(node) {
            continue;
        }
        match serde_json::from_str::<NodeSnapshot>(raw) {
            Ok(snapshot) => view.graph.merge(snapshot.waits, snapshot.holds),
            Err(e) => warn!(node = %node, "Skipping unreadable node snapshot: {}", e),
        }
    }
    Ok(view)
}

async fn excise_nodes(store: &RetryingStore, keys: &KeySpace, nodes: &[String]) -> Result<()> {
    for node in nodes {
        store.hash_delete(&keys.detector_heartbeats(), node).await?;
        store.hash_delete(&keys.detector_graph(), node).await?;
        warn!(node = %node, "Excised stale node from the detector graph");
    }

    let victims = store.hash_get_all(&keys.detector_victims()).await?;
    for (field, raw) in victims {
        let stale = serde_json::from_str::<RecoveryEvent>(&raw)
            .map(|event| nodes.contains(&event.victim.node_id))
            .unwrap_or(true);
        if stale {
            store.hash_delete(&keys.detector_victims(), &field).await?;
        }
    }
    Ok(())
}

/// Break every cycle by releasing the victim's leases that other
/// participants wait on, then publish a recovery event per cycle.
pub async fn recover_cycles(
    store: &RetryingStore,
    keys: &KeySpace,
    locks: &LockSet,
    graph: &WaitForGraph,
    cycles: &[Vec<WaiterId>],
    coordinator: &str,
) -> Result<Vec<RecoveryEvent>> {
    let mut events = Vec::with_capacity(cycles.len());

    for cycle in cycles {
        let Some(victim) = select_victim(cycle) else {
            continue;
        };
        let waited_on: Vec<String> = cycle.iter().flat_map(|w| graph.waits_of(w)).collect();

        let mut released = Vec::new();
        for lease in graph.leases_held_by(victim) {
            if !waited_on.contains(&lease.lock_key) {
                continue;
            }
            let token = LockToken::from(lease.token.as_str());
            let lease_key = keys.lease_key(lease.lock_type, &lease.resource);
            match locks
                .variant(lease.lock_type)
                .release(&lease.resource, &token)
                .await
            {
                Ok(true) => released.push(lease_key),
                Ok(false) => debug!(key = %lease_key, "Victim lease already gone"),
                Err(e) => warn!(key = %lease_key, "Failed to release victim lease: {}", e),
            }
        }

        let event = RecoveryEvent {
            cycle: cycle.clone(),
            victim: victim.clone(),
            released,
            coordinator: coordinator.to_string(),
            at_ms: current_timestamp(),
        };
        warn!(
            victim = %event.victim,
            cycle = ?event.cycle,
            released = ?event.released,
            "Distributed deadlock recovered"
        );

        let message = serde_json::to_string(&event)?;
        store
            .hash_put(&keys.detector_victims(), &victim.to_string(), &message)
            .await?;
        store.publish(&keys.recovery_channel(), &message).await?;
        events.push(event);
    }
    Ok(events)
}

struct DetectorInner {
    state: DetectorState,
    live_nodes: Vec<String>,
    is_coordinator: bool,
    last_sync_ms: Option<i64>,
    last_detection: Option<DetectionReport>,
}

pub struct DistributedDeadlockDetector {
    ctx: Arc<EngineContext>,
    enabled: Arc<AtomicBool>,
    events: broadcast::Sender<RecoveryEvent>,
    inner: Mutex<DetectorInner>,
    passes: AtomicU64,
    recoveries: AtomicU64,
}

impl DistributedDeadlockDetector {
    pub fn new(
        ctx: Arc<EngineContext>,
        enabled: Arc<AtomicBool>,
        events: broadcast::Sender<RecoveryEvent>,
    ) -> Self {
        Self {
            ctx,
            enabled,
            events,
            inner: Mutex::new(DetectorInner {
                state: DetectorState::Idle,
                live_nodes: Vec::new(),
                is_coordinator: false,
                last_sync_ms: None,
                last_detection: None,
            }),
            passes: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
        }
    }

    fn set_state(&self, state: DetectorState) {
        self.inner.lock().state = state;
    }

    /// Export this node's wait-for state and refresh its heartbeat
    pub async fn sync(&self) -> Result<()> {
        self.set_state(DetectorState::Syncing);
        let result = self.sync_once().await;
        let mut inner = self.inner.lock();
        inner.state = DetectorState::Idle;
        if result.is_ok() {
            inner.last_sync_ms = Some(current_timestamp());
        }
        result
    }

    async fn sync_once(&self) -> Result<()> {
        let ctx = &self.ctx;
        self.apply_victims().await?;
        ctx.validate_holds().await?;

        let (waits, holds) = ctx.detector.snapshot();
        let now = current_timestamp();
        let snapshot = NodeSnapshot {
            node_id: ctx.node_id.clone(),
            heartbeat_ms: now,
            waits,
            holds,
        };
        let raw = serde_json::to_string(&snapshot)?;
        ctx.store
            .hash_put(&ctx.keys.detector_graph(), &ctx.node_id, &raw)
            .await?;
        ctx.store
            .hash_put(&ctx.keys.detector_heartbeats(), &ctx.node_id, &now.to_string())
            .await?;
        debug!(
            node = %ctx.node_id,
            waits = snapshot.waits.len(),
            holds = snapshot.holds.len(),
            "Detector state synced"
        );
        Ok(())
    }

    /// Abort local waiters that a coordinator elsewhere picked as victims
    async fn apply_victims(&self) -> Result<()> {
        let ctx = &self.ctx;
        let victims = ctx.store.hash_get_all(&ctx.keys.detector_victims()).await?;
        for (field, raw) in victims {
            let Ok(event) = serde_json::from_str::<RecoveryEvent>(&raw) else {
                continue;
            };
            if event.victim.node_id != ctx.node_id {
                continue;
            }
            ctx.detector.abort_waiter(&event.victim, event.cycle.clone());
            ctx.store
                .hash_delete(&ctx.keys.detector_victims(), &field)
                .await?;
        }
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let ctx = &self.ctx;
        ctx.store
            .hash_put(
                &ctx.keys.detector_heartbeats(),
                &ctx.node_id,
                &current_timestamp().to_string(),
            )
            .await
    }

    /// Run one detection pass.
    ///
    /// Scheduled passes only run when detection is enabled and this node
    /// coordinates; `force` skips both checks. `recover` releases victim
    /// leases, otherwise the pass only reports. Returns `None` when the pass
    /// was skipped.
    pub async fn detect(&self, force: bool, recover: bool) -> Result<Option<DetectionReport>> {
        if !force && !self.enabled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.set_state(DetectorState::Detecting);
        let result = self.detect_once(force, recover).await;
        self.set_state(DetectorState::Idle);
        result
    }

    async fn detect_once(&self, force: bool, recover: bool) -> Result<Option<DetectionReport>> {
        let ctx = &self.ctx;
        let now = current_timestamp();
        let view = load_cluster_view(
            &ctx.store,
            &ctx.keys,
            ctx.config.node_timeout(),
            now,
            true,
        )
        .await?;

        let live_nodes: Vec<String> = view.live_nodes.keys().cloned().collect();
        let is_coordinator = view.coordinator() == Some(ctx.node_id.as_str());
        {
            let mut inner = self.inner.lock();
            inner.live_nodes = live_nodes.clone();
            inner.is_coordinator = is_coordinator;
        }
        if !force && !is_coordinator {
            debug!(
                node = %ctx.node_id,
                coordinator = ?view.coordinator(),
                "Not the coordinator, skipping detection"
            );
            return Ok(None);
        }

        let cycles = view.graph.find_cycles();
        let recoveries = if recover && !cycles.is_empty() {
            recover_cycles(
                &ctx.store,
                &ctx.keys,
                &ctx.locks,
                &view.graph,
                &cycles,
                &ctx.node_id,
            )
            .await?
        } else {
            Vec::new()
        };

        for event in &recoveries {
            ctx.monitor.record_deadlock("distributed");
            if event.victim.node_id == ctx.node_id {
                ctx.detector.abort_waiter(&event.victim, event.cycle.clone());
                ctx.store
                    .hash_delete(&ctx.keys.detector_victims(), &event.victim.to_string())
                    .await?;
            }
            let _ = self.events.send(event.clone());
        }
        if !recoveries.is_empty() {
            ctx.validate_holds().await?;
        }

        let report = DetectionReport {
            at_ms: now,
            coordinator: ctx.node_id.clone(),
            live_nodes,
            excised_nodes: view.stale_nodes,
            cycles,
            recoveries,
        };
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.recoveries
            .fetch_add(report.recoveries.len() as u64, Ordering::Relaxed);
        if !report.cycles.is_empty() {
            info!(
                cycles = report.cycles.len(),
                recovered = report.recoveries.len(),
                "Distributed detection pass found deadlocks"
            );
        }
        self.inner.lock().last_detection = Some(report.clone());
        Ok(Some(report))
    }

    pub fn status(&self) -> DetectorStatus {
        let inner = self.inner.lock();
        DetectorStatus {
            enabled: self.enabled.load(Ordering::SeqCst),
            state: inner.state,
            node_id: self.ctx.node_id.clone(),
            live_nodes: inner.live_nodes.clone(),
            is_coordinator: inner.is_coordinator,
            last_sync_ms: inner.last_sync_ms,
            last_detection: inner.last_detection.clone(),
            passes: self.passes.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }

    /// Remove this node's records so other nodes stop counting it as live
    pub async fn deregister(&self) -> Result<()> {
        let ctx = &self.ctx;
        ctx.store
            .hash_delete(&ctx.keys.detector_graph(), &ctx.node_id)
            .await?;
        ctx.store
            .hash_delete(&ctx.keys.detector_heartbeats(), &ctx.node_id)
            .await?;
        info!(node = %ctx.node_id, "Detector records removed");
        Ok(())
    }

    /// Start the heartbeat, sync and detection timers
    pub fn spawn_tasks(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let config = &self.ctx.config;
        let runtime = &self.ctx.runtime;
        let mut tasks = Vec::with_capacity(3);

        let detector = self.clone();
        let mut stop = shutdown.clone();
        let period = config.heartbeat_interval();
        tasks.push(runtime.spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = detector.heartbeat().await {
                            warn!("Detector heartbeat failed: {}", e);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        let detector = self.clone();
        let mut stop = shutdown.clone();
        let period = config.sync_interval();
        tasks.push(runtime.spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = detector.sync().await {
                            warn!("Detector sync failed: {}", e);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        let detector = self.clone();
        let mut stop = shutdown.clone();
        let period = config.detection_interval();
        tasks.push(runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = detector.detect(false, true).await {
                            error!("Deadlock detection pass failed: {}", e);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        info!(
            node = %self.ctx.node_id,
            sync_ms = config.sync_interval_ms,
            detection_ms = config.detection_interval_ms,
            "Distributed deadlock detector started"
        );
        tasks
    }
}
