//! Session manager — validation, limits, and background sweep over a
//! [`SessionStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SessionSettings;
use crate::error::{ProxyError, ProxyResult};

use super::{SessionInfo, SessionStats, SessionStore};

/// Manages sessions with TTL clamping, per-agent limits, and a periodic
/// expiry sweep.
pub struct SessionManager {
    settings: SessionSettings,
    store: Arc<dyn SessionStore>,
    running: Arc<Mutex<bool>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Create a manager over the given store.
    pub fn new(settings: SessionSettings, store: Arc<dyn SessionStore>) -> Self {
        Self {
            settings,
            store,
            running: Arc::new(Mutex::new(false)),
            sweeper: Mutex::new(None),
        }
    }

    /// Start the background sweeper. Idempotent.
    pub async fn start(&self) {
        {
            let mut running = self.running.lock().await;
            if *running {
                return;
            }
            *running = true;
        }

        let store = Arc::clone(&self.store);
        let running = Arc::clone(&self.running);
        let interval = Duration::from_secs(self.settings.cleanup_interval_seconds);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !*running.lock().await {
                    break;
                }
                match store.cleanup_expired().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Cleaned up expired sessions"),
                    Err(e) => error!(error = %e, "Session cleanup failed"),
                }
            }
        });
        *self.sweeper.lock().await = Some(handle);
        info!(
            cleanup_interval_secs = self.settings.cleanup_interval_seconds,
            "Session manager started"
        );
    }

    /// Stop the sweeper. Idempotent.
    pub async fn stop(&self) {
        {
            let mut running = self.running.lock().await;
            if !*running {
                return;
            }
            *running = false;
        }
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        info!("Session manager stopped");
    }

    async fn ensure_running(&self) -> ProxyResult<()> {
        if *self.running.lock().await {
            Ok(())
        } else {
            Err(ProxyError::Shutdown(
                "session manager is not running".to_string(),
            ))
        }
    }

    /// Create a session for an agent.
    ///
    /// The TTL is clamped to `[1, maxTtlSeconds]`; the per-agent session
    /// cap is enforced here and fails loudly with `InvalidParams`.
    pub async fn create(
        &self,
        agent_id: &str,
        correlation_id: Option<String>,
        ttl_seconds: Option<i64>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> ProxyResult<SessionInfo> {
        self.ensure_running().await?;

        let ttl = match ttl_seconds {
            Some(requested) => self.settings.clamp_ttl(requested),
            None => self.settings.default_ttl_seconds,
        };

        let existing = self.store.list(Some(agent_id), false).await?;
        if existing.len() >= self.settings.max_sessions_per_agent {
            warn!(
                agent_id = %agent_id,
                limit = self.settings.max_sessions_per_agent,
                "Agent reached session limit"
            );
            return Err(ProxyError::invalid_params(format!(
                "agent {agent_id} has reached the maximum session limit ({})",
                self.settings.max_sessions_per_agent
            )));
        }

        let session = self
            .store
            .create(agent_id, correlation_id, Some(ttl), metadata)
            .await?;
        info!(
            session_id = %session.session_id,
            agent_id = %agent_id,
            ttl_seconds = ttl,
            "Session created"
        );
        Ok(session)
    }

    /// Get a session by id. Expired sessions are invisible and lazily
    /// deleted here. `touch` updates the last-activity timestamp.
    pub async fn get(&self, session_id: &str, touch: bool) -> ProxyResult<Option<SessionInfo>> {
        self.ensure_running().await?;

        let Some(mut session) = self.store.get(session_id).await? else {
            return Ok(None);
        };

        if session.is_expired() {
            info!(session_id = %session_id, "Session expired, removing");
            self.store.delete(session_id).await?;
            return Ok(None);
        }

        if touch {
            session.touch();
            self.store.update(&session).await?;
        }
        Ok(Some(session))
    }

    /// Extend a session's TTL (clamped). Returns false for unknown or
    /// expired sessions.
    pub async fn extend(&self, session_id: &str, ttl_seconds: i64) -> ProxyResult<bool> {
        self.ensure_running().await?;

        let Some(mut session) = self.get(session_id, false).await? else {
            return Ok(false);
        };
        session.extend_ttl(self.settings.clamp_ttl(ttl_seconds));
        let updated = self.store.update(&session).await?;
        if updated {
            info!(session_id = %session_id, ttl_seconds, "Session extended");
        }
        Ok(updated)
    }

    /// Delete a session. Returns false if it did not exist.
    pub async fn delete(&self, session_id: &str) -> ProxyResult<bool> {
        self.ensure_running().await?;
        info!(session_id = %session_id, "Deleting session");
        self.store.delete(session_id).await
    }

    /// List sessions, optionally by agent / including expired.
    pub async fn list(
        &self,
        agent_id: Option<&str>,
        include_expired: bool,
    ) -> ProxyResult<Vec<SessionInfo>> {
        self.ensure_running().await?;
        self.store.list(agent_id, include_expired).await
    }

    /// Aggregate statistics.
    pub async fn stats(&self) -> ProxyResult<SessionStats> {
        self.ensure_running().await?;
        self.store.stats().await
    }

    /// Find the active session bound to a correlation id.
    pub async fn get_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> ProxyResult<Option<SessionInfo>> {
        self.ensure_running().await?;
        self.store.get_by_correlation_id(correlation_id).await
    }

    /// Manually trigger a sweep of expired sessions.
    pub async fn cleanup_expired(&self) -> ProxyResult<usize> {
        self.ensure_running().await?;
        self.store.cleanup_expired().await
    }

    /// The configured settings (used by the HTTP surface for defaults).
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }
}
