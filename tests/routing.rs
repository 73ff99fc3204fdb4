//! Tests for the router — local HTTP dispatch, the full remote
//! round-trip over the bus, timeout behavior, and local-only mode.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use a2a_proxy::bus::{
    BusAdmin, BusClient, InMemoryBus, MessagePublisher, SubscriberOrchestrator, TopicProperties,
};
use a2a_proxy::config::SubscriptionConfig;
use a2a_proxy::error::ProxyError;
use a2a_proxy::pending::PendingRequestManager;
use a2a_proxy::registry::AgentRegistry;
use a2a_proxy::routing::Router;
use a2a_proxy::types::AgentInfo;
use serde_json::json;

use common::spawn_agent;

fn agents(entries: Vec<AgentInfo>) -> HashMap<String, AgentInfo> {
    entries.into_iter().map(|a| (a.id.clone(), a)).collect()
}

async fn started_pending() -> Arc<PendingRequestManager> {
    let pending = Arc::new(PendingRequestManager::new());
    pending.start().await;
    pending
}

#[tokio::test]
async fn local_round_trip_forwards_verbatim_with_correlation() {
    let (addr, log) = spawn_agent(json!({ "name": "writer" })).await;
    let writer = AgentInfo::new("writer", "proxy-1", "blog")
        .unwrap()
        .with_fqdn(addr.to_string());
    let registry = Arc::new(AgentRegistry::new(agents(vec![writer])));
    let pending = started_pending().await;
    let router = Router::new("proxy-1", registry, None, Arc::clone(&pending));

    let body = json!({"jsonrpc": "2.0", "method": "message/send", "id": "x"});
    let response = router
        .route(
            "writer",
            "/v1/messages:send",
            "POST",
            Some(body.clone()),
            HashMap::new(),
            Some("c1".to_string()),
        )
        .await
        .unwrap();

    // Body comes back verbatim from the agent.
    assert_eq!(response.status, 200);
    assert_eq!(response.body, body);

    // The correlation id was forwarded downstream.
    let requests = log.lock().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].headers.get("x-correlation-id").map(String::as_str),
        Some("c1")
    );
    pending.stop().await;
}

#[tokio::test]
async fn unknown_agent_fails_agent_unavailable() {
    let registry = Arc::new(AgentRegistry::new(HashMap::new()));
    let pending = started_pending().await;
    let router = Router::new("proxy-1", registry, None, Arc::clone(&pending));

    let err = router
        .route("ghost", "/health", "GET", None, HashMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::AgentUnavailable { .. }));
    assert_eq!(err.http_status(), 404);
    pending.stop().await;
}

#[tokio::test]
async fn unreachable_local_agent_fails_agent_unavailable() {
    // Nothing listens on this port.
    let writer = AgentInfo::new("writer", "proxy-1", "blog")
        .unwrap()
        .with_fqdn("127.0.0.1:1");
    let registry = Arc::new(AgentRegistry::new(agents(vec![writer])));
    let pending = started_pending().await;
    let router = Router::new("proxy-1", registry, None, Arc::clone(&pending));

    let err = router
        .route("writer", "/health", "GET", None, HashMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::AgentUnavailable { .. }));
    assert_eq!(err.http_status(), 502);
    pending.stop().await;
}

#[tokio::test]
async fn remote_without_publisher_is_unsupported() {
    let critic = AgentInfo::new("critic", "proxy-2", "review").unwrap();
    let registry = Arc::new(AgentRegistry::new(agents(vec![critic])));
    let pending = started_pending().await;
    let router = Router::new("proxy-1", registry, None, Arc::clone(&pending));

    let err = router
        .route("critic", "/health", "GET", None, HashMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::UnsupportedOperation { .. }));
    pending.stop().await;
}

/// Full remote round-trip: proxy-1 routes to `critic`, owned by proxy-2.
/// The request travels `a2a.review.requests`, proxy-2 forwards it to the
/// agent over HTTP and answers on `a2a.review.responses` with
/// `toProxy = proxy-1`, which proxy-1's response subscription feeds back
/// into the correlator.
#[tokio::test]
async fn remote_round_trip_over_the_bus() {
    let (addr, agent_log) = spawn_agent(json!({
        "name": "critic",
        "url": "http://critic.internal:8001/",
    }))
    .await;

    let critic = AgentInfo::new("critic", "proxy-2", "review")
        .unwrap()
        .with_fqdn(addr.to_string());
    let shared_agents = agents(vec![critic]);

    // One shared fabric.
    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
    let bus_dyn: Arc<dyn BusClient> = bus.clone();
    bus_dyn.start().await.unwrap();

    // proxy-2: hosts critic, consumes its requests.
    let registry2 = Arc::new(AgentRegistry::new(shared_agents.clone()));
    let publisher2 = Arc::new(MessagePublisher::new(Arc::clone(&bus_dyn)));
    let pending2 = started_pending().await;
    let orchestrator2 = SubscriberOrchestrator::new(
        "proxy-2",
        vec![SubscriptionConfig {
            group: "review".to_string(),
            filter: "toAgent = 'critic'".to_string(),
        }],
        Arc::clone(&bus_dyn),
        registry2,
        publisher2,
        Arc::clone(&pending2),
    );
    orchestrator2.start().await.unwrap();

    // proxy-1: routes remotely, consumes responses addressed to itself.
    let registry1 = Arc::new(AgentRegistry::new(shared_agents));
    let publisher1 = Arc::new(MessagePublisher::new(Arc::clone(&bus_dyn)));
    let pending1 = started_pending().await;
    let orchestrator1 = SubscriberOrchestrator::new(
        "proxy-1",
        vec![SubscriptionConfig {
            group: "review".to_string(),
            filter: "toAgent = 'writer'".to_string(),
        }],
        Arc::clone(&bus_dyn),
        Arc::clone(&registry1),
        Arc::clone(&publisher1),
        Arc::clone(&pending1),
    );
    orchestrator1.start().await.unwrap();

    let router1 = Router::new(
        "proxy-1",
        registry1,
        Some(publisher1),
        Arc::clone(&pending1),
    );

    let response = router1
        .route(
            "critic",
            "/.well-known/agent.json",
            "GET",
            None,
            HashMap::new(),
            Some("c2".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body["name"], "critic");

    // proxy-2 really did call the agent over HTTP, with the correlation id.
    let requests = agent_log.lock().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/.well-known/agent.json");
    assert_eq!(
        requests[0].headers.get("x-correlation-id").map(String::as_str),
        Some("c2")
    );

    // Correlator is drained on both sides.
    assert_eq!(pending1.pending_count().await, 0);

    pending1.stop().await;
    pending2.stop().await;
    bus_dyn.stop().await;
}

#[tokio::test]
async fn publish_failure_cancels_pending_and_times_out() {
    // The request topic was never provisioned, so the publish fails.
    let critic = AgentInfo::new("critic", "proxy-2", "review").unwrap();
    let registry = Arc::new(AgentRegistry::new(agents(vec![critic])));
    let bus: Arc<dyn BusClient> = Arc::new(InMemoryBus::new());
    bus.start().await.unwrap();
    let publisher = Arc::new(MessagePublisher::new(Arc::clone(&bus)));
    let pending = started_pending().await;
    let router = Router::new("proxy-1", registry, Some(publisher), Arc::clone(&pending));

    let err = router
        .route("critic", "/health", "GET", None, HashMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Timeout { .. }));
    assert_eq!(pending.pending_count().await, 0);

    pending.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn remote_request_times_out_when_nobody_answers() {
    let critic = AgentInfo::new("critic", "proxy-2", "review").unwrap();
    let registry = Arc::new(AgentRegistry::new(agents(vec![critic])));

    let bus = Arc::new(InMemoryBus::new());
    let bus_dyn: Arc<dyn BusClient> = bus.clone();
    bus_dyn.start().await.unwrap();
    // Topic exists, but no subscriber will ever respond.
    let admin = bus.admin();
    admin
        .create_topic(
            "a2a.review.requests",
            &TopicProperties {
                default_message_ttl_secs: 3600,
                max_size_in_megabytes: 1024,
                requires_duplicate_detection: true,
                duplicate_detection_window_minutes: 10,
                enable_partitioning: false,
                support_ordering: true,
                enable_express: false,
            },
        )
        .await
        .unwrap();

    let publisher = Arc::new(MessagePublisher::new(Arc::clone(&bus_dyn)));
    let pending = started_pending().await;
    let router = Router::new("proxy-1", registry, Some(publisher), Arc::clone(&pending))
        .with_request_timeout_secs(1);

    let started = tokio::time::Instant::now();
    let err = router
        .route("critic", "/health", "GET", None, HashMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(pending.pending_count().await, 0);

    pending.stop().await;
    bus_dyn.stop().await;
}
