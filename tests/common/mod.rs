//! Shared test fixtures: a stub downstream agent served by axum.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::Mutex;

/// One request observed by the stub agent.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// Requests the stub agent has served, in arrival order.
pub type RequestLog = Arc<Mutex<Vec<RecordedRequest>>>;

struct AgentState {
    card: Value,
    log: RequestLog,
}

/// Spawn a stub A2A agent on an ephemeral port.
///
/// Serves its card, a health endpoint, and a `messages:send` endpoint
/// that echoes the request body back verbatim. Every request is recorded.
pub async fn spawn_agent(card: Value) -> (SocketAddr, RequestLog) {
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let state = Arc::new(AgentState {
        card,
        log: Arc::clone(&log),
    });

    let app = Router::new()
        .route("/.well-known/agent.json", get(serve_card))
        .route("/health", get(serve_health))
        .route("/v1/messages:send", post(echo_message))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, log)
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

async fn serve_card(
    State(state): State<Arc<AgentState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.log.lock().await.push(RecordedRequest {
        path: "/.well-known/agent.json".to_string(),
        headers: header_map(&headers),
        body: Value::Null,
    });
    Json(state.card.clone())
}

async fn serve_health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn echo_message(
    State(state): State<Arc<AgentState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.log.lock().await.push(RecordedRequest {
        path: "/v1/messages:send".to_string(),
        headers: header_map(&headers),
        body: body.clone(),
    });
    Json(body)
}
