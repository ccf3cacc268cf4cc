//! Hasp Lock - Distributed locks over a shared lease store
//!
//! This crate provides:
//! - Mutual-exclusion, read-write and fair (FIFO) locks
//! - Reentrant holds with watchdog lease renewal
//! - Local and cluster-wide deadlock detection with victim recovery
//! - A performance monitor backed by the `metrics` facade
//! - `LockManager`, the lazily started façade with an idle reaper

pub mod context;
pub mod detector;
pub mod fair;
pub mod manager;
pub mod monitor;
pub mod mutex;
pub mod reentrant;
pub mod rwlock;
pub mod variant;
pub mod watchdog;

// Re-export key types
pub use context::EngineContext;
pub use detector::{
    ClusterView, DetectionReport, DetectorState, DetectorStatus, DistributedDeadlockDetector,
    LocalDeadlockDetector, RecoveryEvent, WaitForGraph, load_cluster_view, recover_cycles,
};
pub use manager::{LockClient, LockManager, LockRequest};
pub use monitor::{PerformanceMonitor, PerformanceSnapshot, describe_metrics};
pub use variant::{LockSet, LockVariant};
