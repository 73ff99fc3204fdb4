//! Tests for the pending-request correlator — exactly-once completion,
//! timeout sweeping, shutdown fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use a2a_proxy::error::ProxyError;
use a2a_proxy::pending::PendingRequestManager;
use serde_json::json;

#[tokio::test]
async fn create_and_correlate_response() {
    let mgr = Arc::new(PendingRequestManager::new());
    mgr.start().await;
    mgr.create("c-1", 30, HashMap::new()).await.unwrap();
    assert_eq!(mgr.pending_count().await, 1);

    let waiter = {
        let mgr = Arc::clone(&mgr);
        tokio::spawn(async move { mgr.wait("c-1").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(mgr.handle_response("c-1", json!({"answer": 42})).await);
    let result = waiter.await.unwrap().unwrap();
    assert_eq!(result["answer"], 42);

    // Entry removed after the wait resolves.
    assert_eq!(mgr.pending_count().await, 0);
    mgr.stop().await;
}

#[tokio::test]
async fn wait_for_unknown_correlation_fails() {
    let mgr = PendingRequestManager::new();
    mgr.start().await;
    let err = mgr.wait("missing").await.unwrap_err();
    assert!(matches!(err, ProxyError::TaskNotFound { .. }));
    mgr.stop().await;
}

#[tokio::test]
async fn expired_entry_times_out_at_wait() {
    let mgr = PendingRequestManager::new();
    mgr.start().await;
    // Zero timeout: already expired by the time we wait.
    mgr.create("c-1", 0, HashMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = mgr.wait("c-1").await.unwrap_err();
    assert!(matches!(err, ProxyError::Timeout { .. }));
    assert_eq!(mgr.pending_count().await, 0);
    mgr.stop().await;
}

#[tokio::test]
async fn wait_times_out_while_parked() {
    let mgr = PendingRequestManager::new();
    mgr.start().await;
    mgr.create("c-1", 1, HashMap::new()).await.unwrap();

    let err = mgr.wait("c-1").await.unwrap_err();
    assert!(matches!(err, ProxyError::Timeout { .. }));
    mgr.stop().await;
}

#[tokio::test]
async fn sweeper_rejects_expired_entries() {
    let mgr = PendingRequestManager::with_cleanup_interval(Duration::from_millis(50));
    mgr.start().await;
    mgr.create("c-1", 0, HashMap::new()).await.unwrap();

    // Nobody is waiting; the sweeper must still enforce the deadline.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(mgr.pending_count().await, 0);

    let err = mgr.wait("c-1").await.unwrap_err();
    assert!(matches!(err, ProxyError::TaskNotFound { .. }));
    mgr.stop().await;
}

#[tokio::test]
async fn duplicate_create_overwrites() {
    let mgr = PendingRequestManager::new();
    mgr.start().await;
    mgr.create("c-1", 30, HashMap::new()).await.unwrap();
    mgr.create("c-1", 60, HashMap::new()).await.unwrap();

    // Still one entry, carrying the newer timeout.
    assert_eq!(mgr.pending_count().await, 1);
    let info = mgr.request_info("c-1").await.unwrap();
    assert_eq!(info.timeout_seconds, 60);
    assert!(!info.is_completed);
    mgr.stop().await;
}

#[tokio::test]
async fn concurrent_responses_exactly_one_wins() {
    let mgr = Arc::new(PendingRequestManager::new());
    mgr.start().await;
    mgr.create("c-1", 30, HashMap::new()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let mgr = Arc::clone(&mgr);
        handles.push(tokio::spawn(async move {
            mgr.handle_response("c-1", json!({"winner": i})).await
        }));
    }
    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    mgr.stop().await;
}

#[tokio::test]
async fn handle_error_rejects_waiter() {
    let mgr = Arc::new(PendingRequestManager::new());
    mgr.start().await;
    mgr.create("c-1", 30, HashMap::new()).await.unwrap();

    let waiter = {
        let mgr = Arc::clone(&mgr);
        tokio::spawn(async move { mgr.wait("c-1").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(
        mgr.handle_error("c-1", ProxyError::agent_unavailable("critic is down"))
            .await
    );
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, ProxyError::AgentUnavailable { .. }));
    mgr.stop().await;
}

#[tokio::test]
async fn shutdown_fans_out_to_all_waiters() {
    let mgr = Arc::new(PendingRequestManager::new());
    mgr.start().await;

    let mut waiters = Vec::new();
    for i in 0..3 {
        let cid = format!("c-{i}");
        mgr.create(&cid, 30, HashMap::new()).await.unwrap();
        let mgr = Arc::clone(&mgr);
        waiters.push(tokio::spawn(async move { mgr.wait(&cid).await }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    mgr.stop().await;
    for waiter in waiters {
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::Shutdown(_)));
    }
    assert_eq!(mgr.pending_count().await, 0);
}

#[tokio::test]
async fn create_after_stop_fails() {
    let mgr = PendingRequestManager::new();
    mgr.start().await;
    mgr.stop().await;
    let err = mgr.create("c-1", 30, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, ProxyError::Shutdown(_)));
}

#[tokio::test]
async fn response_after_completion_returns_false() {
    let mgr = PendingRequestManager::new();
    mgr.start().await;
    mgr.create("c-1", 30, HashMap::new()).await.unwrap();

    assert!(mgr.handle_response("c-1", json!(1)).await);
    assert!(!mgr.handle_response("c-1", json!(2)).await);
    assert!(!mgr.handle_error("c-1", ProxyError::timeout("late")).await);
    mgr.stop().await;
}
