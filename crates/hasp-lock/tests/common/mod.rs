//! Shared setup for the lock integration tests
//!
//! Every test builds its managers on one `MemoryLeaseStore`; two managers
//! with different node ids on the same store stand in for two processes.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hasp_common::LockConfig;
use hasp_lock::LockManager;
use hasp_store::MemoryLeaseStore;

/// Lease TTL used by most tests
pub const TTL: Duration = Duration::from_secs(5);

/// Short backoff and no scheduled detection; tests trigger passes by hand
pub fn test_config(node: &str) -> LockConfig {
    LockConfig {
        node_id: Some(node.to_string()),
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        distributed_detection_enabled: false,
        ..Default::default()
    }
}

pub fn memory_store() -> Arc<MemoryLeaseStore> {
    Arc::new(MemoryLeaseStore::new())
}

pub fn manager_on(store: &Arc<MemoryLeaseStore>, node: &str) -> LockManager {
    manager_with(store, test_config(node))
}

pub fn manager_with(store: &Arc<MemoryLeaseStore>, config: LockConfig) -> LockManager {
    LockManager::new(store.clone(), config).expect("valid test config")
}
