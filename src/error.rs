//! Proxy error types — JSON-RPC error codes + proxy-specific errors.
//!
//! The proxy speaks JSON-RPC 2.0 to its callers, so every user-visible
//! failure maps to a numeric error code and an HTTP status:
//! - Standard JSON-RPC 2.0 errors (-32700 through -32603)
//! - A2A proxy errors (-32001 through -32004)

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Standard JSON-RPC 2.0 error codes
// ---------------------------------------------------------------------------

/// Invalid JSON was received by the server.
pub const PARSE_ERROR: i64 = -32700;

/// The JSON sent is not a valid Request object.
pub const INVALID_REQUEST: i64 = -32600;

/// The method does not exist / is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Invalid method parameter(s).
pub const INVALID_PARAMS: i64 = -32602;

/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

// ---------------------------------------------------------------------------
// A2A proxy error codes
// ---------------------------------------------------------------------------

/// The requested task was not found.
pub const TASK_NOT_FOUND: i64 = -32001;

/// The target agent is not reachable (or not known to the registry).
pub const AGENT_UNAVAILABLE: i64 = -32002;

/// A pending request expired before a response arrived.
pub const TIMEOUT_ERROR: i64 = -32003;

/// The requested operation is disabled in this proxy instance.
pub const UNSUPPORTED_OPERATION: i64 = -32004;

// ---------------------------------------------------------------------------
// JSON-RPC error envelope
// ---------------------------------------------------------------------------

/// JSON-RPC 2.0 error object carried in protocol error responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// ProxyError enum
// ---------------------------------------------------------------------------

/// Unified error type for all proxy and JSON-RPC errors.
///
/// Protocol variants carry a human-readable message and an optional
/// structured `data` payload. Transport-side variants cover failures that
/// never cross the wire as JSON-RPC errors (they map to `InternalError`
/// if they ever must).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    /// Invalid JSON payload (code -32700).
    #[error("Parse error: {message}")]
    ParseError {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Request payload validation error (code -32600).
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Method not found (code -32601).
    #[error("Method not found: {message}")]
    MethodNotFound {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Invalid parameters (code -32602).
    #[error("Invalid params: {message}")]
    InvalidParams {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Internal error (code -32603).
    #[error("Internal error: {message}")]
    InternalError {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Task not found (code -32001).
    #[error("Task not found: {message}")]
    TaskNotFound {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Target agent unknown or unreachable (code -32002).
    #[error("Agent unavailable: {message}")]
    AgentUnavailable {
        /// Human-readable error message.
        message: String,
        /// HTTP status returned by the agent, when one was received.
        status: Option<u16>,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Pending request expired (code -32003).
    #[error("Timeout: {message}")]
    Timeout {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Operation disabled in this proxy (code -32004).
    #[error("Unsupported operation: {message}")]
    UnsupportedOperation {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    // -- Transport / infrastructure errors (not wire codes) --
    /// Transport-level error (connection failed, request failed, etc.).
    #[error("Transport error: {0}")]
    Transport(String),

    /// HTTP error with status code and response body.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// Invalid JSON received from a peer (parse or deserialization failure).
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// Configuration loading or validation failure.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The component received the request after (or during) shutdown.
    #[error("Shutting down: {0}")]
    Shutdown(String),

    /// Catch-all for errors that don't fit other categories.
    #[error("{0}")]
    Other(String),
}

/// Convenience result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    // -- Convenience constructors (message-only, no data) --

    /// Create a `ParseError` with a message and no data.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidRequest` with a message and no data.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `MethodNotFound` with a message and no data.
    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::MethodNotFound {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidParams` with a message and no data.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InternalError` with a message and no data.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `TaskNotFound` with a message and no data.
    pub fn task_not_found(message: impl Into<String>) -> Self {
        Self::TaskNotFound {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `AgentUnavailable` for an agent missing from the registry.
    pub fn agent_not_found(agent_id: impl AsRef<str>) -> Self {
        Self::AgentUnavailable {
            message: format!("Agent '{}' not found", agent_id.as_ref()),
            status: None,
            data: Some(serde_json::json!({ "agentId": agent_id.as_ref() })),
        }
    }

    /// Create an `AgentUnavailable` with a message and no attached status.
    pub fn agent_unavailable(message: impl Into<String>) -> Self {
        Self::AgentUnavailable {
            message: message.into(),
            status: None,
            data: None,
        }
    }

    /// Create an `AgentUnavailable` carrying the downstream HTTP status.
    pub fn agent_unavailable_with_status(message: impl Into<String>, status: u16) -> Self {
        Self::AgentUnavailable {
            message: message.into(),
            status: Some(status),
            data: None,
        }
    }

    /// Create a `Timeout` with a message and no data.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `UnsupportedOperation` with a message and no data.
    pub fn unsupported_operation(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            message: message.into(),
            data: None,
        }
    }

    /// Returns the JSON-RPC error code for this error variant.
    ///
    /// Transport-side errors that don't map to proxy codes return
    /// -32603 (internal error).
    pub fn code(&self) -> i64 {
        match self {
            ProxyError::ParseError { .. } => PARSE_ERROR,
            ProxyError::InvalidRequest { .. } => INVALID_REQUEST,
            ProxyError::MethodNotFound { .. } => METHOD_NOT_FOUND,
            ProxyError::InvalidParams { .. } => INVALID_PARAMS,
            ProxyError::InternalError { .. } => INTERNAL_ERROR,
            ProxyError::TaskNotFound { .. } => TASK_NOT_FOUND,
            ProxyError::AgentUnavailable { .. } => AGENT_UNAVAILABLE,
            ProxyError::Timeout { .. } => TIMEOUT_ERROR,
            ProxyError::UnsupportedOperation { .. } => UNSUPPORTED_OPERATION,
            ProxyError::Transport(_)
            | ProxyError::Http { .. }
            | ProxyError::InvalidJson(_)
            | ProxyError::Config(_)
            | ProxyError::Shutdown(_)
            | ProxyError::Other(_) => INTERNAL_ERROR,
        }
    }

    /// Returns the HTTP status the proxy surface uses for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ProxyError::ParseError { .. }
            | ProxyError::InvalidRequest { .. }
            | ProxyError::InvalidParams { .. } => 400,
            ProxyError::MethodNotFound { .. } | ProxyError::TaskNotFound { .. } => 404,
            // An agent missing from the registry is a 404; a reachable-but-
            // failing agent is a 502.
            ProxyError::AgentUnavailable { status, data, .. } => {
                if status.is_none()
                    && data
                        .as_ref()
                        .map(|d| d.get("agentId").is_some())
                        .unwrap_or(false)
                {
                    404
                } else {
                    502
                }
            }
            ProxyError::Timeout { .. } => 504,
            ProxyError::UnsupportedOperation { .. } => 501,
            _ => 500,
        }
    }
}

impl From<ProxyError> for JsonRpcError {
    fn from(err: ProxyError) -> Self {
        let code = err.code();
        let message = err.to_string();
        let data = match &err {
            ProxyError::ParseError { data, .. }
            | ProxyError::InvalidRequest { data, .. }
            | ProxyError::MethodNotFound { data, .. }
            | ProxyError::InvalidParams { data, .. }
            | ProxyError::InternalError { data, .. }
            | ProxyError::TaskNotFound { data, .. }
            | ProxyError::Timeout { data, .. }
            | ProxyError::UnsupportedOperation { data, .. } => data.clone(),
            ProxyError::AgentUnavailable { status, data, .. } => match (status, data) {
                (Some(s), Some(d)) => {
                    let mut merged = d.clone();
                    if let Some(obj) = merged.as_object_mut() {
                        obj.insert("statusCode".to_string(), serde_json::json!(s));
                    }
                    Some(merged)
                }
                (Some(s), None) => Some(serde_json::json!({ "statusCode": s })),
                (None, d) => d.clone(),
            },
            _ => None,
        };
        JsonRpcError {
            code,
            message,
            data,
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::ParseError {
            message: err.to_string(),
            data: None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::InternalError {
            message: err.to_string(),
            data: None,
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Transport(err.to_string())
    }
}
