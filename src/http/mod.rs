//! External HTTP surface — thin axum layer over the [`AppContext`].
//!
//! Protocol errors are rendered as JSON-RPC error envelopes
//! (`{jsonrpc, error: {code, message, data?}, id: null}`) with the HTTP
//! status mapped from the error kind.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router as AxumRouter;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::app::AppContext;
use crate::error::{JsonRpcError, ProxyError};
use crate::sessions::SessionInfo;
use crate::types::{ProxyRole, AGENT_CARD_PATH, MESSAGES_SEND_PATH};

/// Build the axum router for a proxy instance.
pub fn proxy_router(ctx: Arc<AppContext>) -> AxumRouter {
    AxumRouter::new()
        .route("/health", get(health))
        .route("/.well-known/agent.json", get(proxy_agent_card))
        .route("/agents/{agent_id}/.well-known/agent.json", get(agent_card))
        .route("/{agent_id}/.well-known/agent.json", get(agent_card_alias))
        .route("/agents/{agent_id}/v1/messages:send", post(send_message))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/stats", get(session_stats))
        .route("/sessions/correlation/{correlation_id}", get(session_by_correlation))
        .route(
            "/sessions/{session_id}",
            get(get_session).delete(delete_session),
        )
        .route("/sessions/{session_id}/extend", put(extend_session))
        .route("/admin/topics", get(admin_list_topics))
        .route("/admin/topics/groups", get(admin_list_groups))
        .route("/admin/topics/{group}/validate", post(admin_validate_topics))
        .route("/admin/topics/{group}/recreate", put(admin_recreate_topics))
        .route("/debug/agents", get(debug_agents))
        .route("/debug/config", get(debug_config))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Render a proxy error as the JSON-RPC error envelope.
fn error_response(err: ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let rpc: JsonRpcError = err.into();
    (
        status,
        Json(json!({
            "jsonrpc": "2.0",
            "error": rpc,
            "id": null,
        })),
    )
        .into_response()
}

/// Base URL of this proxy as seen by the caller.
fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

fn forwardable_headers(headers: &HeaderMap) -> HashMap<String, String> {
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

// ---------------------------------------------------------------------------
// Health + cards
// ---------------------------------------------------------------------------

/// `GET /health` — liveness plus the per-agent health map. Always 200.
async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let agent_health = ctx.registry.health_status().await;
    let bus_stats = ctx.bus.as_ref().map(|bus| bus.stats());
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "role": ctx.config.proxy.role,
        "proxyId": ctx.config.proxy.id,
        "uptimeSeconds": ctx.uptime_seconds(),
        "connections": {
            "agents": agent_health,
            "bus": bus_stats,
        },
    }))
}

/// `GET /.well-known/agent.json` — the proxy's own capability card.
async fn proxy_agent_card(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Json<Value> {
    Json(json!({
        "name": format!("A2A Proxy {}", ctx.config.proxy.id),
        "description": "Service Bus proxy for A2A agents",
        "url": base_url(&headers),
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": {
            "streaming": true,
            "stateTransitionHistory": false,
            "routing": true,
            "multiTenant": true,
        },
        "role": ctx.config.proxy.role,
    }))
}

/// `GET /agents/{id}/.well-known/agent.json` — fetch a target agent's
/// card via routing; the card's URL is rewritten to point back through
/// the proxy.
async fn agent_card(
    State(ctx): State<Arc<AppContext>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    info!(agent_id = %agent_id, "Fetching agent card");
    let correlation_id = headers
        .get("x-correlation-id")
        .and_then(|h| h.to_str().ok())
        .map(String::from);

    match ctx
        .router
        .route(
            &agent_id,
            AGENT_CARD_PATH,
            "GET",
            None,
            forwardable_headers(&headers),
            correlation_id,
        )
        .await
    {
        Ok(route) => {
            let mut card = route.body;
            if let Some(obj) = card.as_object_mut() {
                obj.insert(
                    "url".to_string(),
                    Value::String(format!("{}/agents/{agent_id}", base_url(&headers))),
                );
            }
            Json(card).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `GET /{id}/.well-known/agent.json` — backward-compatible alias.
async fn agent_card_alias(
    state: State<Arc<AppContext>>,
    path: Path<String>,
    headers: HeaderMap,
) -> Response {
    agent_card(state, path, headers).await
}

// ---------------------------------------------------------------------------
// Message routing
// ---------------------------------------------------------------------------

/// `POST /agents/{id}/v1/messages:send` — forward a JSON body to the
/// agent, honouring `X-Correlation-ID`.
async fn send_message(
    State(ctx): State<Arc<AppContext>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let payload: Value = match serde_json::from_str(&body) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => {
            return error_response(ProxyError::invalid_request(
                "request body must be a JSON object",
            ));
        }
        Err(e) => {
            return error_response(ProxyError::parse_error(format!("invalid JSON body: {e}")));
        }
    };

    let correlation_id = headers
        .get("x-correlation-id")
        .and_then(|h| h.to_str().ok())
        .map(String::from);
    info!(
        agent_id = %agent_id,
        correlation_id = ?correlation_id,
        "Processing message send request"
    );

    match ctx
        .router
        .route(
            &agent_id,
            MESSAGES_SEND_PATH,
            "POST",
            Some(payload),
            forwardable_headers(&headers),
            correlation_id,
        )
        .await
    {
        Ok(route) => {
            let status =
                StatusCode::from_u16(route.status).unwrap_or(StatusCode::OK);
            (status, Json(route.body)).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    agent_id: String,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    ttl_seconds: Option<i64>,
    #[serde(default)]
    metadata: Option<HashMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct GetSessionQuery {
    #[serde(default = "default_touch")]
    touch: bool,
}

fn default_touch() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendSessionBody {
    ttl_seconds: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSessionsQuery {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    include_expired: bool,
}

fn session_json(session: &SessionInfo) -> Value {
    json!({
        "sessionId": session.session_id,
        "agentId": session.agent_id,
        "correlationId": session.correlation_id,
        "createdAt": session.created_at,
        "lastActivity": session.last_activity,
        "expiresAt": session.expires_at,
        "isExpired": session.is_expired(),
        "metadata": session.metadata,
    })
}

/// `POST /sessions`
async fn create_session(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateSessionBody>,
) -> Response {
    match ctx
        .sessions
        .create(
            &body.agent_id,
            body.correlation_id,
            body.ttl_seconds,
            body.metadata.unwrap_or_default(),
        )
        .await
    {
        Ok(session) => (StatusCode::CREATED, Json(session_json(&session))).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /sessions/{id}`
async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
    Query(query): Query<GetSessionQuery>,
) -> Response {
    match ctx.sessions.get(&session_id, query.touch).await {
        Ok(Some(session)) => Json(session_json(&session)).into_response(),
        Ok(None) => error_response(ProxyError::task_not_found("Session not found")),
        Err(e) => error_response(e),
    }
}

/// `PUT /sessions/{id}/extend`
async fn extend_session(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
    Json(body): Json<ExtendSessionBody>,
) -> Response {
    match ctx.sessions.extend(&session_id, body.ttl_seconds).await {
        Ok(true) => Json(json!({ "success": true, "ttlSeconds": body.ttl_seconds })).into_response(),
        Ok(false) => error_response(ProxyError::task_not_found("Session not found")),
        Err(e) => error_response(e),
    }
}

/// `DELETE /sessions/{id}`
async fn delete_session(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
) -> Response {
    match ctx.sessions.delete(&session_id).await {
        Ok(true) => Json(json!({ "success": true })).into_response(),
        Ok(false) => error_response(ProxyError::task_not_found("Session not found")),
        Err(e) => error_response(e),
    }
}

/// `GET /sessions`
async fn list_sessions(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListSessionsQuery>,
) -> Response {
    match ctx
        .sessions
        .list(query.agent_id.as_deref(), query.include_expired)
        .await
    {
        Ok(sessions) => Json(json!({
            "sessions": sessions.iter().map(session_json).collect::<Vec<_>>(),
            "total": sessions.len(),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /sessions/stats`
async fn session_stats(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.sessions.stats().await {
        Ok(stats) => Json(json!(stats)).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /sessions/correlation/{id}`
async fn session_by_correlation(
    State(ctx): State<Arc<AppContext>>,
    Path(correlation_id): Path<String>,
) -> Response {
    match ctx.sessions.get_by_correlation_id(&correlation_id).await {
        Ok(Some(session)) => Json(session_json(&session)).into_response(),
        Ok(None) => error_response(ProxyError::task_not_found("Session not found")),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// Admin (coordinator only)
// ---------------------------------------------------------------------------

/// Reject non-coordinators; hand back the topic manager otherwise.
fn require_coordinator(ctx: &AppContext) -> Result<Arc<crate::topics::TopicManager>, Response> {
    if ctx.config.proxy.role != ProxyRole::Coordinator {
        warn!("Topic admin rejected: not a coordinator");
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": crate::error::UNSUPPORTED_OPERATION,
                    "message": "Topic management only available on coordinator proxies",
                },
                "id": null,
            })),
        )
            .into_response());
    }
    match &ctx.topic_manager {
        Some(manager) => Ok(Arc::clone(manager)),
        None => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": crate::error::INTERNAL_ERROR,
                    "message": "Service Bus not configured",
                },
                "id": null,
            })),
        )
            .into_response()),
    }
}

/// `GET /admin/topics`
async fn admin_list_topics(State(ctx): State<Arc<AppContext>>) -> Response {
    let manager = match require_coordinator(&ctx) {
        Ok(manager) => manager,
        Err(resp) => return resp,
    };
    match manager.list_managed_topics().await {
        Ok(topics) => Json(json!({
            "topics": topics,
            "total": topics.len(),
            "timestamp": chrono::Utc::now(),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /admin/topics/{group}/validate`
async fn admin_validate_topics(
    State(ctx): State<Arc<AppContext>>,
    Path(group): Path<String>,
) -> Response {
    let manager = match require_coordinator(&ctx) {
        Ok(manager) => manager,
        Err(resp) => return resp,
    };
    let health = manager.validate_topic_health(&group).await;
    Json(json!({
        "groupName": health.group_name,
        "status": health.status,
        "topics": health.topics,
        "errors": health.errors,
        "timestamp": chrono::Utc::now(),
    }))
    .into_response()
}

/// `PUT /admin/topics/{group}/recreate` — destructive.
async fn admin_recreate_topics(
    State(ctx): State<Arc<AppContext>>,
    Path(group): Path<String>,
) -> Response {
    let manager = match require_coordinator(&ctx) {
        Ok(manager) => manager,
        Err(resp) => return resp,
    };
    let Some(group_config) = ctx.config.find_group(&group).cloned() else {
        return error_response(ProxyError::task_not_found(format!(
            "agent group '{group}' not found in configuration"
        )));
    };

    let (deleted, created) = manager.recreate(&group_config).await;
    Json(json!({
        "groupName": group,
        "deleteResults": deleted,
        "createResult": created,
        "timestamp": chrono::Utc::now(),
    }))
    .into_response()
}

/// `GET /admin/topics/groups`
async fn admin_list_groups(State(ctx): State<Arc<AppContext>>) -> Response {
    if ctx.config.proxy.role != ProxyRole::Coordinator {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": crate::error::UNSUPPORTED_OPERATION,
                    "message": "Group information only available on coordinator proxies",
                },
                "id": null,
            })),
        )
            .into_response();
    }
    let groups: Vec<Value> = ctx
        .config
        .agent_groups
        .iter()
        .map(|g| json!(g))
        .collect();
    Json(json!({
        "groups": groups,
        "total": groups.len(),
        "timestamp": chrono::Utc::now(),
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// Debug
// ---------------------------------------------------------------------------

/// `GET /debug/agents` — read-only registry introspection.
async fn debug_agents(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let agents = ctx.registry.all().await;
    Json(json!({
        "agents": agents,
        "groups": ctx.registry.groups().await,
        "totalCount": agents.len(),
    }))
}

/// `GET /debug/config` — read-only configuration introspection.
async fn debug_config(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "id": ctx.config.proxy.id,
        "role": ctx.config.proxy.role,
        "port": ctx.config.proxy.port,
        "hostedAgents": ctx.config.hosted_agents,
        "subscriptions": ctx.config.subscriptions,
        "localOnly": ctx.bus.is_none(),
    }))
}
