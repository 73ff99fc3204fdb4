//! Routing engine — local vs. remote dispatch with reply stitching.
//!
//! A request for a locally hosted agent goes straight out over HTTP. A
//! request for an agent behind another proxy is wrapped in an envelope,
//! registered with the pending-request correlator, published onto the
//! owning group's request topic, and the caller is parked on the pending
//! promise until the correlated response comes back off the bus.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::MessagePublisher;
use crate::error::{ProxyError, ProxyResult};
use crate::pending::PendingRequestManager;
use crate::registry::AgentRegistry;
use crate::types::{AgentInfo, MessageEnvelope, DEFAULT_REQUEST_TIMEOUT_SECS};

/// What a routed call produced: the downstream status plus its body.
#[derive(Debug, Clone)]
pub struct RouteResponse {
    /// HTTP status from the target agent.
    pub status: u16,
    /// Response body, JSON when the agent returned JSON.
    pub body: Value,
}

/// Routes requests between local and remote agents.
pub struct Router {
    registry: Arc<AgentRegistry>,
    publisher: Option<Arc<MessagePublisher>>,
    pending: Arc<PendingRequestManager>,
    proxy_id: String,
    http: reqwest::Client,
    request_timeout_secs: i64,
}

impl Router {
    /// Wire up the router. `publisher` is `None` in local-only mode, in
    /// which case remote routes fail with `UnsupportedOperation`.
    pub fn new(
        proxy_id: impl Into<String>,
        registry: Arc<AgentRegistry>,
        publisher: Option<Arc<MessagePublisher>>,
        pending: Arc<PendingRequestManager>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            registry,
            publisher,
            pending,
            proxy_id: proxy_id.into(),
            http,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS as i64,
        }
    }

    /// Override the remote-request timeout (mostly for tests).
    pub fn with_request_timeout_secs(mut self, secs: i64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Route an HTTP request to the named agent, wherever it lives.
    pub async fn route(
        &self,
        agent_id: &str,
        path: &str,
        method: &str,
        body: Option<Value>,
        headers: HashMap<String, String>,
        correlation_id: Option<String>,
    ) -> ProxyResult<RouteResponse> {
        info!(
            agent_id = %agent_id,
            path = %path,
            method = %method,
            correlation_id = ?correlation_id,
            "Routing request"
        );

        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| ProxyError::agent_not_found(agent_id))?;

        if self.is_local(&agent) {
            self.route_local(&agent, path, method, body, headers, correlation_id)
                .await
        } else {
            self.route_remote(&agent, path, method, body, headers, correlation_id)
                .await
        }
    }

    /// Local iff this proxy owns the agent and it has an endpoint.
    fn is_local(&self, agent: &AgentInfo) -> bool {
        agent.proxy_id == self.proxy_id && agent.fqdn.is_some()
    }

    async fn route_local(
        &self,
        agent: &AgentInfo,
        path: &str,
        method: &str,
        body: Option<Value>,
        headers: HashMap<String, String>,
        correlation_id: Option<String>,
    ) -> ProxyResult<RouteResponse> {
        let fqdn = agent.fqdn.as_deref().ok_or_else(|| {
            ProxyError::agent_unavailable(format!("local agent {} has no FQDN", agent.id))
        })?;
        let url = format!("http://{fqdn}{path}");
        debug!(agent_id = %agent.id, url = %url, "Routing to local agent");

        let method = reqwest::Method::from_str(method).map_err(|_| {
            ProxyError::invalid_request(format!("unsupported HTTP method: {method}"))
        })?;
        let mut req = self.http.request(method, &url);
        for (key, value) in &headers {
            if key.eq_ignore_ascii_case("host") || key.eq_ignore_ascii_case("content-length") {
                continue;
            }
            req = req.header(key, value);
        }
        if let Some(cid) = &correlation_id {
            req = req.header("X-Correlation-ID", cid);
        }
        if let Some(body) = &body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| {
            warn!(agent_id = %agent.id, error = %e, "Local agent call failed");
            ProxyError::agent_unavailable(format!("failed to reach agent {}: {e}", agent.id))
        })?;

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let text = resp.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            warn!(
                agent_id = %agent.id,
                status,
                "Local agent returned error status"
            );
            return Err(ProxyError::agent_unavailable_with_status(
                format!("agent {} returned status {status}", agent.id),
                status,
            ));
        }

        // Forward the body verbatim; non-JSON bodies are wrapped.
        let body = if content_type.contains("application/json") {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            serde_json::json!({ "data": text, "contentType": content_type })
        };
        info!(agent_id = %agent.id, status, "Local routing successful");
        Ok(RouteResponse { status, body })
    }

    async fn route_remote(
        &self,
        agent: &AgentInfo,
        path: &str,
        method: &str,
        body: Option<Value>,
        headers: HashMap<String, String>,
        correlation_id: Option<String>,
    ) -> ProxyResult<RouteResponse> {
        let Some(publisher) = &self.publisher else {
            return Err(ProxyError::unsupported_operation(
                "Service Bus not configured for remote routing",
            ));
        };

        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!(
            agent_id = %agent.id,
            owning_proxy = %agent.proxy_id,
            correlation_id = %correlation_id,
            "Routing to remote agent"
        );

        let mut envelope =
            MessageEnvelope::request(&self.proxy_id, &agent.id, path, &correlation_id)
                .with_method(method)
                .with_headers(headers)
                // The message must not outlive the pending wait: once the
                // correlator gives up, an undelivered request is garbage.
                .with_ttl(self.request_timeout_secs)?;
        // The proxy itself is the requesting party; replies address it.
        envelope.from_agent = Some(self.proxy_id.clone());
        envelope.body = body.clone();

        let payload = match &body {
            Some(value) => serde_json::to_vec(value)?,
            None => Vec::new(),
        };

        self.pending
            .create(&correlation_id, self.request_timeout_secs, HashMap::new())
            .await?;

        // Session key = correlation id: the request and every correlated
        // follow-up serialize through one broker session.
        let published = publisher
            .publish_request(envelope, payload, &agent.group, None)
            .await;
        if !published {
            self.pending.cancel(&correlation_id).await;
            return Err(ProxyError::timeout(format!(
                "failed to publish request for agent {}",
                agent.id
            )));
        }

        let value = self.pending.wait(&correlation_id).await?;
        let status = value
            .get("statusCode")
            .and_then(|s| s.as_u64())
            .unwrap_or(200) as u16;
        let body = value.get("body").cloned().unwrap_or(Value::Null);
        info!(
            agent_id = %agent.id,
            status,
            correlation_id = %correlation_id,
            "Remote routing successful"
        );
        Ok(RouteResponse { status, body })
    }
}
