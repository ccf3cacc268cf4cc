//! Lock manager lifecycle tests
//!
//! Lazy start, idle reaping, scoped execution and shutdown.

mod common;

use std::time::Duration;

use common::{TTL, manager_on, manager_with, memory_store, test_config};
use hasp_common::{KeySpace, LockConfig, LockError, LockKey};
use hasp_lock::LockRequest;
use hasp_store::LeaseStore;

fn reaping_config(node: &str) -> LockConfig {
    LockConfig {
        idle_reap_threshold_ms: 200,
        idle_check_interval_ms: 50,
        ..test_config(node)
    }
}

// ============== Idle Reaper Tests ==============

#[tokio::test]
async fn test_idle_engine_is_reaped_and_restarted() {
    let store = memory_store();
    let manager = manager_with(&store, reaping_config("node-a"));
    let client = manager.client("c1");

    let token = client.try_lock("order", "1", TTL).await.unwrap().unwrap();
    assert!(client.unlock("order", "1", &token).await.unwrap());
    assert!(manager.is_running());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!manager.is_running());
    assert!(manager.detector_status().is_none());

    assert!(client.try_lock("order", "1", TTL).await.unwrap().is_some());
    assert!(manager.is_running());
    assert_eq!(manager.start_count(), 2);
}

#[tokio::test]
async fn test_reaper_leaves_engine_with_held_lease() {
    let store = memory_store();
    let manager = manager_with(&store, reaping_config("node-a"));
    let client = manager.client("c1");
    let other = manager.client("c2");

    let token = client.try_lock("order", "2", TTL).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(manager.is_running());
    assert_eq!(manager.start_count(), 1);

    assert!(other.try_lock("order", "2", TTL).await.unwrap().is_none());
    assert!(client.unlock("order", "2", &token).await.unwrap());
}

#[tokio::test]
async fn test_reaping_does_not_touch_store_leases() {
    let store = memory_store();
    let manager = manager_with(&store, reaping_config("node-a"));
    let key = LockKey::new("order", "3").unwrap();

    // taken around the manager, so the engine itself holds nothing
    let lease = KeySpace::default().exclusive(&key);
    assert!(store.try_acquire(&lease, "outsider", TTL).await.unwrap());
    manager.trigger_sync().await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!manager.is_running());
    assert_eq!(
        store.current_token(&lease).await.unwrap().as_deref(),
        Some("outsider")
    );
}

// ============== Scoped Execution Tests ==============

#[tokio::test]
async fn test_execute_with_lock_returns_body_value() {
    let store = memory_store();
    let manager = manager_on(&store, "node-a");
    let client = manager.client("c1");
    let other = manager.client("c2");
    let request = LockRequest::exclusive("report", "1")
        .with_ttl(TTL)
        .with_max_wait(Duration::from_secs(1));

    let contender = other.clone();
    let value: Result<u32, LockError> = client
        .execute_with_lock(&request, move || async move {
            assert!(contender.try_lock("report", "1", TTL).await.unwrap().is_none());
            Ok::<u32, LockError>(42)
        })
        .await;
    assert_eq!(value, Ok(42));
    assert!(other.try_lock("report", "1", TTL).await.unwrap().is_some());
}

#[tokio::test]
async fn test_execute_with_lock_releases_on_body_error() {
    let store = memory_store();
    let manager = manager_on(&store, "node-a");
    let client = manager.client("c1");
    let other = manager.client("c2");
    let request = LockRequest::write("report", "2")
        .with_ttl(TTL)
        .with_max_wait(Duration::from_secs(1));

    let outcome: anyhow::Result<u32> = client
        .execute_with_lock(&request, || async {
            Err::<u32, anyhow::Error>(anyhow::anyhow!("report generation failed"))
        })
        .await;
    assert_eq!(
        outcome.unwrap_err().to_string(),
        "report generation failed"
    );
    assert!(other.try_write_lock("report", "2", TTL).await.unwrap().is_some());
}

#[tokio::test]
async fn test_execute_with_lock_releases_after_panic() {
    let store = memory_store();
    let manager = manager_on(&store, "node-a");
    let client = manager.client("c1");
    let other = manager.client("c2");
    let request = LockRequest::fair("report", "3")
        .with_ttl(TTL)
        .with_max_wait(Duration::from_secs(1));

    let fail = true;
    let task = tokio::spawn(async move {
        client
            .execute_with_lock(&request, move || async move {
                if fail {
                    panic!("body panicked");
                }
                Ok::<(), LockError>(())
            })
            .await
    });
    assert!(task.await.unwrap_err().is_panic());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(other.try_fair_lock("report", "3", TTL).await.unwrap().is_some());
}

#[tokio::test]
async fn test_execute_with_lock_surfaces_timeout() {
    let store = memory_store();
    let manager = manager_on(&store, "node-a");
    let holder = manager.client("holder");
    let client = manager.client("c1");
    holder.try_lock("report", "4", TTL).await.unwrap().unwrap();

    let request = LockRequest::exclusive("report", "4")
        .with_ttl(TTL)
        .with_max_wait(Duration::from_millis(50));
    let outcome: Result<(), LockError> = client
        .execute_with_lock(&request, || async {
            Err::<(), LockError>(LockError::IllegalArgument("body ran".to_string()))
        })
        .await;
    assert!(matches!(outcome, Err(LockError::LockTimeout { .. })));
}

// ============== Shutdown Tests ==============

#[tokio::test]
async fn test_shutdown_deregisters_node() {
    let store = memory_store();
    let node_a = manager_on(&store, "node-a");
    let node_b = manager_on(&store, "node-b");

    node_a.trigger_sync().await.unwrap();
    node_b.trigger_sync().await.unwrap();
    let report = node_b.trigger_detection(false).await.unwrap();
    assert_eq!(report.live_nodes, vec!["node-a", "node-b"]);

    node_a.shutdown().await;
    let report = node_b.trigger_detection(false).await.unwrap();
    assert_eq!(report.live_nodes, vec!["node-b"]);
    assert!(report.excised_nodes.is_empty());

    let err = node_a.client("c1").try_lock("order", "1", TTL).await;
    assert_eq!(err, Err(LockError::ShutDown));
    assert_eq!(node_a.trigger_sync().await, Err(LockError::ShutDown));
}
