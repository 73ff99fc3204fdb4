//! Tests for the external HTTP surface — health, cards, message send,
//! session CRUD, admin authorization, and the JSON-RPC error envelope.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use a2a_proxy::app::AppContext;
use a2a_proxy::bus::{BusAdmin, BusClient, InMemoryBus};
use a2a_proxy::config::{
    ProxyConfig, ProxyIdentity, SessionSettings, SubscriptionConfig, TopicGroupConfig,
};
use a2a_proxy::http::proxy_router;
use a2a_proxy::types::{AgentInfo, ProxyRole};
use serde_json::{json, Value};
use tempfile::TempDir;

use common::spawn_agent;

fn base_config(role: ProxyRole, sessions_dir: &TempDir) -> ProxyConfig {
    ProxyConfig {
        proxy: ProxyIdentity {
            id: "proxy-1".to_string(),
            role,
            port: 0,
        },
        servicebus: None,
        hosted_agents: HashMap::new(),
        subscriptions: Vec::new(),
        sessions: Some(SessionSettings {
            default_ttl_seconds: 3600,
            max_ttl_seconds: 86400,
            cleanup_interval_seconds: 3600,
            max_sessions_per_agent: 100,
            store_path: sessions_dir.path().to_path_buf(),
        }),
        agent_groups: Vec::new(),
        agent_registry: None,
    }
}

async fn serve(ctx: Arc<AppContext>) -> SocketAddr {
    let app = proxy_router(ctx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn follower_ctx(
    sessions_dir: &TempDir,
    agents: HashMap<String, AgentInfo>,
) -> Arc<AppContext> {
    AppContext::assemble(base_config(ProxyRole::Follower, sessions_dir), agents, None, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn health_is_always_200() {
    let dir = TempDir::new().unwrap();
    let ctx = follower_ctx(&dir, HashMap::new()).await;
    let addr = serve(ctx.clone()).await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["proxyId"], "proxy-1");
    assert_eq!(body["role"], "follower");
    ctx.shutdown().await;
}

#[tokio::test]
async fn proxy_serves_its_own_card() {
    let dir = TempDir::new().unwrap();
    let ctx = follower_ctx(&dir, HashMap::new()).await;
    let addr = serve(ctx.clone()).await;

    let body: Value = reqwest::get(format!("http://{addr}/.well-known/agent.json"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["name"], "A2A Proxy proxy-1");
    assert_eq!(body["capabilities"]["routing"], true);
    ctx.shutdown().await;
}

#[tokio::test]
async fn local_message_send_round_trip() {
    let (agent_addr, agent_log) = spawn_agent(json!({ "name": "writer" })).await;
    let writer = AgentInfo::new("writer", "proxy-1", "blog")
        .unwrap()
        .with_fqdn(agent_addr.to_string());
    let dir = TempDir::new().unwrap();
    let ctx = follower_ctx(&dir, [("writer".to_string(), writer)].into()).await;
    let addr = serve(ctx.clone()).await;

    let body = json!({"jsonrpc": "2.0", "method": "message/send", "id": "x"});
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/agents/writer/v1/messages:send"))
        .header("X-Correlation-ID", "c1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let echoed: Value = resp.json().await.unwrap();
    assert_eq!(echoed, body);

    let seen = agent_log.lock().await;
    assert_eq!(
        seen[0].headers.get("x-correlation-id").map(String::as_str),
        Some("c1")
    );
    ctx.shutdown().await;
}

#[tokio::test]
async fn agent_card_url_is_rewritten_to_proxy_path() {
    let (agent_addr, _) = spawn_agent(json!({
        "name": "writer",
        "url": "http://writer.internal:9999/",
    }))
    .await;
    let writer = AgentInfo::new("writer", "proxy-1", "blog")
        .unwrap()
        .with_fqdn(agent_addr.to_string());
    let dir = TempDir::new().unwrap();
    let ctx = follower_ctx(&dir, [("writer".to_string(), writer)].into()).await;
    let addr = serve(ctx.clone()).await;

    for path in [
        format!("http://{addr}/agents/writer/.well-known/agent.json"),
        format!("http://{addr}/writer/.well-known/agent.json"),
    ] {
        let card: Value = reqwest::get(path).await.unwrap().json().await.unwrap();
        assert_eq!(card["name"], "writer");
        assert_eq!(card["url"], format!("http://{addr}/agents/writer"));
    }
    ctx.shutdown().await;
}

#[tokio::test]
async fn unknown_agent_returns_json_rpc_error_envelope() {
    let dir = TempDir::new().unwrap();
    let ctx = follower_ctx(&dir, HashMap::new()).await;
    let addr = serve(ctx.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/agents/ghost/v1/messages:send"))
        .json(&json!({"jsonrpc": "2.0"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["error"]["code"], -32002);
    assert_eq!(body["id"], Value::Null);
    ctx.shutdown().await;
}

#[tokio::test]
async fn malformed_body_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let ctx = follower_ctx(&dir, HashMap::new()).await;
    let addr = serve(ctx.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/agents/writer/v1/messages:send"))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32700);
    ctx.shutdown().await;
}

#[tokio::test]
async fn session_crud_over_http() {
    let dir = TempDir::new().unwrap();
    let ctx = follower_ctx(&dir, HashMap::new()).await;
    let addr = serve(ctx.clone()).await;
    let client = reqwest::Client::new();

    // Create.
    let resp = client
        .post(format!("http://{addr}/sessions"))
        .json(&json!({
            "agentId": "writer",
            "correlationId": "c-9",
            "ttlSeconds": 600,
            "metadata": {"purpose": "test"},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    let session_id = created["sessionId"].as_str().unwrap().to_string();
    assert_eq!(created["agentId"], "writer");

    // Fetch.
    let fetched: Value = client
        .get(format!("http://{addr}/sessions/{session_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["correlationId"], "c-9");

    // Extend.
    let extended: Value = client
        .put(format!("http://{addr}/sessions/{session_id}/extend"))
        .json(&json!({"ttlSeconds": 7200}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(extended["success"], true);

    // List + stats + correlation lookup.
    let listed: Value = client
        .get(format!("http://{addr}/sessions?agentId=writer"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["total"], 1);

    let stats: Value = client
        .get(format!("http://{addr}/sessions/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["activeSessions"], 1);

    let by_corr: Value = client
        .get(format!("http://{addr}/sessions/correlation/c-9"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(by_corr["sessionId"], session_id.as_str());

    // Delete, then 404.
    let deleted: Value = client
        .delete(format!("http://{addr}/sessions/{session_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["success"], true);
    let resp = client
        .get(format!("http://{addr}/sessions/{session_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    ctx.shutdown().await;
}

#[tokio::test]
async fn admin_endpoints_forbidden_for_followers() {
    let dir = TempDir::new().unwrap();
    let ctx = follower_ctx(&dir, HashMap::new()).await;
    let addr = serve(ctx.clone()).await;
    let client = reqwest::Client::new();

    for (method, path) in [
        ("GET", "/admin/topics"),
        ("GET", "/admin/topics/groups"),
        ("POST", "/admin/topics/review/validate"),
        ("PUT", "/admin/topics/review/recreate"),
    ] {
        let req = match method {
            "GET" => client.get(format!("http://{addr}{path}")),
            "POST" => client.post(format!("http://{addr}{path}")),
            _ => client.put(format!("http://{addr}{path}")),
        };
        let resp = req.send().await.unwrap();
        assert_eq!(resp.status(), 403, "{method} {path}");
    }
    ctx.shutdown().await;
}

#[tokio::test]
async fn coordinator_admin_surface_over_in_memory_bus() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(ProxyRole::Coordinator, &dir);
    config.agent_groups = vec![TopicGroupConfig {
        name: "review".to_string(),
        description: "review agents".to_string(),
        max_message_size_mb: 1,
        message_ttl_seconds: 3600,
        enable_partitioning: true,
        duplicate_detection_window_minutes: 10,
    }];
    config.subscriptions = vec![SubscriptionConfig {
        group: "review".to_string(),
        filter: "toAgent = 'critic'".to_string(),
    }];

    let bus = Arc::new(InMemoryBus::new());
    let admin: Arc<dyn BusAdmin> = Arc::new(bus.admin());
    let bus_dyn: Arc<dyn BusClient> = bus;
    let ctx = AppContext::assemble(config, HashMap::new(), Some(bus_dyn), Some(admin))
        .await
        .unwrap();
    let addr = serve(ctx.clone()).await;
    let client = reqwest::Client::new();

    // Startup reconciled the triple.
    let topics: Value = client
        .get(format!("http://{addr}/admin/topics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(topics["total"], 3);

    let groups: Value = client
        .get(format!("http://{addr}/admin/topics/groups"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(groups["total"], 1);
    assert_eq!(groups["groups"][0]["name"], "review");

    let health: Value = client
        .post(format!("http://{addr}/admin/topics/review/validate"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let recreated: Value = client
        .put(format!("http://{addr}/admin/topics/review/recreate"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(recreated["createResult"]["requestTopic"]["status"], "created");

    // Unknown group on recreate is a 404.
    let resp = client
        .put(format!("http://{addr}/admin/topics/ghost/recreate"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    ctx.shutdown().await;
}

#[tokio::test]
async fn debug_endpoints_expose_registry_and_config() {
    let writer = AgentInfo::new("writer", "proxy-1", "blog").unwrap();
    let dir = TempDir::new().unwrap();
    let ctx = follower_ctx(&dir, [("writer".to_string(), writer)].into()).await;
    let addr = serve(ctx.clone()).await;

    let agents: Value = reqwest::get(format!("http://{addr}/debug/agents"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agents["totalCount"], 1);
    assert_eq!(agents["groups"][0], "blog");

    let config: Value = reqwest::get(format!("http://{addr}/debug/config"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(config["id"], "proxy-1");
    assert_eq!(config["localOnly"], true);
    ctx.shutdown().await;
}
