//! Core data models shared across the proxy.
//!
//! The central type is [`MessageEnvelope`] — the routing + metadata header
//! that accompanies every bus-borne message. The envelope schema is strict:
//! unknown fields are rejected at deserialization, and the envelope does
//! **not** carry the agent group (the group is resolved from the agent
//! registry at publish time).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Well-known path for agent cards.
pub const AGENT_CARD_PATH: &str = "/.well-known/agent.json";

/// A2A message-send endpoint path.
pub const MESSAGES_SEND_PATH: &str = "/v1/messages:send";

/// Default health endpoint for agents.
pub const HEALTH_PATH: &str = "/health";

/// Shared topic for notification messages. Always hyphenated.
pub const NOTIFICATION_TOPIC: &str = "a2a-notifications";

/// Prefix of every topic managed by the coordinator.
pub const MANAGED_TOPIC_PREFIX: &str = "a2a.";

/// Default timeout for routed requests (local HTTP and pending waits).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default timeout for agent-card fetches and health probes.
pub const DEFAULT_CARD_FETCH_TIMEOUT_SECS: u64 = 10;

/// Default envelope TTL in seconds (1 hour).
pub const DEFAULT_ENVELOPE_TTL_SECS: i64 = 3600;

/// Request topic name for an agent group.
pub fn request_topic(group: &str) -> String {
    format!("a2a.{group}.requests")
}

/// Response topic name for an agent group.
pub fn response_topic(group: &str) -> String {
    format!("a2a.{group}.responses")
}

/// Dead-letter topic name for an agent group.
pub fn deadletter_topic(group: &str) -> String {
    format!("a2a.{group}.deadletter")
}

// ---------------------------------------------------------------------------
// Proxy role
// ---------------------------------------------------------------------------

/// Role of a proxy in the network.
///
/// The coordinator additionally owns topic-lifecycle authority; followers
/// only consume the topic namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyRole {
    /// Manages the bus topic inventory for all groups.
    Coordinator,
    /// Hosts agents and routes; no topic-lifecycle authority.
    Follower,
}

impl std::fmt::Display for ProxyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyRole::Coordinator => write!(f, "coordinator"),
            ProxyRole::Follower => write!(f, "follower"),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentInfo
// ---------------------------------------------------------------------------

/// Information about an agent in the network. Immutable after load.
///
/// `fqdn` is present iff the agent is hosted by some proxy's local network;
/// an agent is *local to this proxy* iff `proxy_id` matches and `fqdn` is
/// set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Unique agent identifier.
    pub id: String,
    /// Identifier of the proxy hosting this agent.
    pub proxy_id: String,
    /// Topic-sharding group the agent belongs to.
    pub group: String,
    /// host:port of the agent, when locally hosted.
    pub fqdn: Option<String>,
    /// Health probe path on the agent.
    pub health_endpoint: String,
    /// Agent card path on the agent.
    pub agent_card_endpoint: String,
    /// Free-form capability tags.
    pub capabilities: Vec<String>,
    /// Opaque A2A capability mapping, forwarded verbatim in fallback cards.
    pub a2a_capabilities: HashMap<String, serde_json::Value>,
}

impl AgentInfo {
    /// Create an `AgentInfo`, validating that `id`, `proxy_id`, and `group`
    /// are nonempty.
    pub fn new(
        id: impl Into<String>,
        proxy_id: impl Into<String>,
        group: impl Into<String>,
    ) -> ProxyResult<Self> {
        let id = id.into();
        let proxy_id = proxy_id.into();
        let group = group.into();
        if id.is_empty() {
            return Err(ProxyError::invalid_params("Agent ID cannot be empty"));
        }
        if proxy_id.is_empty() {
            return Err(ProxyError::invalid_params("Proxy ID cannot be empty"));
        }
        if group.is_empty() {
            return Err(ProxyError::invalid_params("Agent group cannot be empty"));
        }
        Ok(Self {
            id,
            proxy_id,
            group,
            fqdn: None,
            health_endpoint: HEALTH_PATH.to_string(),
            agent_card_endpoint: AGENT_CARD_PATH.to_string(),
            capabilities: Vec::new(),
            a2a_capabilities: HashMap::new(),
        })
    }

    /// Set the agent's FQDN (host:port), marking it as locally hosted.
    pub fn with_fqdn(mut self, fqdn: impl Into<String>) -> Self {
        self.fqdn = Some(fqdn.into());
        self
    }
}

// ---------------------------------------------------------------------------
// MessageEnvelope
// ---------------------------------------------------------------------------

/// Wire protocol carried by the envelope payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    /// Plain request/response over the bus.
    #[default]
    Http,
    /// The payload is a server-sent-events chunk.
    Sse,
}

/// Envelope for messages routed via the bus.
///
/// This is the single wire schema: unknown fields are rejected, and the
/// envelope carries no `group` field — topic selection happens from the
/// agent registry at publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MessageEnvelope {
    // Routing metadata (required)
    /// Proxy that produced this message.
    pub from_proxy: String,
    /// Target agent identifier.
    pub to_agent: String,
    /// HTTP path to invoke on the target agent.
    pub path: String,
    /// Correlation token tying requests to responses. Also the bus session
    /// key unless overridden.
    pub correlation_id: String,

    // Routing metadata (optional)
    /// Originating proxy, set on responses so they route home.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_proxy: Option<String>,
    /// Agent that produced this message, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_agent: Option<String>,
    /// HTTP method for the forwarded call.
    #[serde(default = "default_method")]
    pub method: String,
    /// Wire protocol of the payload.
    #[serde(default)]
    pub protocol: WireProtocol,

    // Request data
    /// Opaque request/response body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// HTTP headers to forward.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Query parameters to forward.
    #[serde(default)]
    pub query_params: HashMap<String, String>,

    // Session management
    /// Application session this message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Ordering sequence within a session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,

    // SSE / streaming
    /// True when the payload is an SSE chunk.
    #[serde(default, rename = "isSSE")]
    pub is_sse: bool,
    /// SSE event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_event: Option<String>,
    /// SSE event id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_id: Option<String>,
    /// SSE retry hint in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_retry: Option<i64>,

    // Response metadata
    /// HTTP status of the agent's reply. Responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    // Message metadata
    /// Creation time, UTC.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Time-to-live in seconds. Must be positive.
    #[serde(default = "default_ttl")]
    pub ttl: i64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_ttl() -> i64 {
    DEFAULT_ENVELOPE_TTL_SECS
}

impl MessageEnvelope {
    /// Create a request envelope with required routing fields and defaults
    /// everywhere else.
    pub fn request(
        from_proxy: impl Into<String>,
        to_agent: impl Into<String>,
        path: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            from_proxy: from_proxy.into(),
            to_agent: to_agent.into(),
            path: path.into(),
            correlation_id: correlation_id.into(),
            to_proxy: None,
            from_agent: None,
            method: default_method(),
            protocol: WireProtocol::default(),
            body: None,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            session_id: None,
            sequence: None,
            is_sse: false,
            sse_event: None,
            sse_id: None,
            sse_retry: None,
            status_code: None,
            timestamp: Utc::now(),
            ttl: DEFAULT_ENVELOPE_TTL_SECS,
        }
    }

    /// Build the reply envelope for this request: proxies and agents swap
    /// roles, the correlation id is preserved.
    pub fn reply(&self, from_proxy: impl Into<String>, status_code: u16) -> Self {
        let mut reply = Self::request(
            from_proxy,
            self.from_agent.clone().unwrap_or_default(),
            self.path.clone(),
            self.correlation_id.clone(),
        );
        reply.to_proxy = Some(self.from_proxy.clone());
        reply.from_agent = Some(self.to_agent.clone());
        reply.session_id = self.session_id.clone();
        reply.status_code = Some(status_code);
        reply
    }

    /// Set the HTTP method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Set the body payload.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set forwarded headers.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Set the TTL, rejecting non-positive values.
    pub fn with_ttl(mut self, ttl: i64) -> ProxyResult<Self> {
        if ttl <= 0 {
            return Err(ProxyError::invalid_params("TTL must be positive"));
        }
        self.ttl = ttl;
        Ok(self)
    }

    /// Validate invariants that serde defaults cannot enforce.
    pub fn validate(&self) -> ProxyResult<()> {
        if self.from_proxy.is_empty() {
            return Err(ProxyError::invalid_params("fromProxy cannot be empty"));
        }
        if self.to_agent.is_empty() {
            return Err(ProxyError::invalid_params("toAgent cannot be empty"));
        }
        if self.correlation_id.is_empty() {
            return Err(ProxyError::invalid_params("correlationId cannot be empty"));
        }
        if self.ttl <= 0 {
            return Err(ProxyError::invalid_params("TTL must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_info_rejects_empty_fields() {
        assert!(AgentInfo::new("", "proxy-1", "review").is_err());
        assert!(AgentInfo::new("critic", "", "review").is_err());
        assert!(AgentInfo::new("critic", "proxy-1", "").is_err());
        assert!(AgentInfo::new("critic", "proxy-1", "review").is_ok());
    }

    #[test]
    fn topic_names() {
        assert_eq!(request_topic("review"), "a2a.review.requests");
        assert_eq!(response_topic("review"), "a2a.review.responses");
        assert_eq!(deadletter_topic("review"), "a2a.review.deadletter");
        assert_eq!(NOTIFICATION_TOPIC, "a2a-notifications");
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let env = MessageEnvelope::request("proxy-1", "writer", "/v1/messages:send", "c-1");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["fromProxy"], "proxy-1");
        assert_eq!(json["toAgent"], "writer");
        assert_eq!(json["correlationId"], "c-1");
        assert_eq!(json["method"], "POST");
        assert_eq!(json["protocol"], "http");
        assert_eq!(json["isSSE"], false);
        assert_eq!(json["ttl"], 3600);
        // Unset optionals are omitted entirely.
        assert!(json.get("toProxy").is_none());
        assert!(json.get("statusCode").is_none());
    }

    #[test]
    fn envelope_rejects_unknown_fields() {
        let raw = serde_json::json!({
            "fromProxy": "proxy-1",
            "toAgent": "writer",
            "path": "/x",
            "correlationId": "c-1",
            "group": "review"
        });
        let parsed: Result<MessageEnvelope, _> = serde_json::from_value(raw);
        assert!(parsed.is_err(), "envelope must not accept a group field");
    }

    #[test]
    fn envelope_rejects_nonpositive_ttl() {
        let env = MessageEnvelope::request("proxy-1", "writer", "/x", "c-1");
        assert!(env.clone().with_ttl(0).is_err());
        assert!(env.clone().with_ttl(-5).is_err());
        assert!(env.with_ttl(60).is_ok());
    }

    #[test]
    fn reply_swaps_routing_fields() {
        let mut req = MessageEnvelope::request("proxy-1", "critic", "/x", "c-2");
        req.from_agent = Some("writer".to_string());
        let reply = req.reply("proxy-2", 200);
        assert_eq!(reply.from_proxy, "proxy-2");
        assert_eq!(reply.to_proxy.as_deref(), Some("proxy-1"));
        assert_eq!(reply.from_agent.as_deref(), Some("critic"));
        assert_eq!(reply.to_agent, "writer");
        assert_eq!(reply.correlation_id, "c-2");
        assert_eq!(reply.status_code, Some(200));
    }
}
