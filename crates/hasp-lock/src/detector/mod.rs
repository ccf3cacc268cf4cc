//! Deadlock detection
//!
//! - `graph`: wait-for graph and cycle search shared by both detectors
//! - `local`: synchronous per-process detection on every blocked acquire
//! - `distributed`: periodic cluster-wide detection and victim recovery

pub mod distributed;
pub mod graph;
pub mod local;

pub use distributed::{
    ClusterView, DetectionReport, DetectorState, DetectorStatus, DistributedDeadlockDetector,
    NodeSnapshot, RecoveryEvent, load_cluster_view, recover_cycles,
};
pub use graph::{HeldLease, WaitEdge, WaitForGraph, canonicalize, select_victim};
pub use local::LocalDeadlockDetector;
