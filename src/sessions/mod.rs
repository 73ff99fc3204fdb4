//! Proxy-level session management.
//!
//! Sessions are application-level stateful associations with a TTL,
//! persisted one file per session — unrelated to bus sessions, which are a
//! broker ordering construct keyed by correlation id.

mod manager;
mod store;

pub use manager::SessionManager;
pub use store::{FileSessionStore, SessionStore};

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Information about an active session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Unique session identifier.
    pub session_id: String,
    /// Agent this session belongs to.
    pub agent_id: String,
    /// Correlation id for message ordering, when bound to one.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last touch time.
    pub last_activity: DateTime<Utc>,
    /// Expiration time; `None` means the session never expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SessionInfo {
    /// Create a session for an agent, unexpiring until a TTL is applied.
    pub fn new(session_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            correlation_id: None,
            created_at: now,
            last_activity: now,
            expires_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Whether the session is past its expiry.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => Utc::now() > expires,
            None => false,
        }
    }

    /// Push expiry `ttl_seconds` into the future and touch the session.
    pub fn extend_ttl(&mut self, ttl_seconds: i64) {
        self.expires_at = Some(Utc::now() + Duration::seconds(ttl_seconds));
        self.last_activity = Utc::now();
    }

    /// Update the last-activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Aggregate counters over the session store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// All sessions on disk, expired included.
    pub total_sessions: usize,
    /// Sessions that have not expired.
    pub active_sessions: usize,
    /// Sessions past expiry but not yet swept.
    pub expired_sessions: usize,
    /// Active session count per agent.
    pub sessions_by_agent: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_without_expiry_never_expires() {
        let session = SessionInfo::new("s-1", "writer");
        assert!(!session.is_expired());
    }

    #[test]
    fn extend_ttl_sets_expiry() {
        let mut session = SessionInfo::new("s-1", "writer");
        session.extend_ttl(60);
        assert!(session.expires_at.is_some());
        assert!(!session.is_expired());

        session.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(session.is_expired());
    }
}
