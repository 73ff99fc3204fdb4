//! Session persistence — one JSON file per session.
//!
//! Writes are serialized through a single mutex and performed as
//! write-temp-then-rename so a crash never leaves a torn file. Reads are
//! lock-free and tolerate missing or malformed files (treated as
//! not-found).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};

use super::{SessionInfo, SessionStats};

/// Abstract session storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create and persist a new session.
    async fn create(
        &self,
        agent_id: &str,
        correlation_id: Option<String>,
        ttl_seconds: Option<i64>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> ProxyResult<SessionInfo>;

    /// Load a session by id. Expired sessions are still returned here;
    /// expiry policy belongs to the manager.
    async fn get(&self, session_id: &str) -> ProxyResult<Option<SessionInfo>>;

    /// Persist an updated session. Returns false if it does not exist.
    async fn update(&self, session: &SessionInfo) -> ProxyResult<bool>;

    /// Delete a session. Returns false if it did not exist.
    async fn delete(&self, session_id: &str) -> ProxyResult<bool>;

    /// List sessions, optionally filtered by agent and including expired.
    async fn list(
        &self,
        agent_id: Option<&str>,
        include_expired: bool,
    ) -> ProxyResult<Vec<SessionInfo>>;

    /// Remove expired sessions; returns the count removed.
    async fn cleanup_expired(&self) -> ProxyResult<usize>;

    /// Aggregate counters.
    async fn stats(&self) -> ProxyResult<SessionStats>;

    /// Find the (active) session bound to a correlation id.
    async fn get_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> ProxyResult<Option<SessionInfo>>;
}

/// File-backed implementation of [`SessionStore`].
#[derive(Debug)]
pub struct FileSessionStore {
    storage_path: PathBuf,
    /// Guards every write so two tasks never interleave on one file.
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    /// Create a store rooted at `storage_path`, creating the directory if
    /// needed.
    pub async fn new(storage_path: impl Into<PathBuf>) -> ProxyResult<Self> {
        let storage_path = storage_path.into();
        fs::create_dir_all(&storage_path).await.map_err(|e| {
            ProxyError::internal_error(format!(
                "failed to create session storage directory: {e}"
            ))
        })?;
        Ok(Self {
            storage_path,
            write_lock: Mutex::new(()),
        })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.storage_path.join(format!("{session_id}.json"))
    }

    /// Serialize and write a session file atomically (temp + rename).
    async fn save_file(&self, session: &SessionInfo) -> ProxyResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.session_path(&session.session_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(session)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        debug!(session_id = %session.session_id, path = ?path, "Session written");
        Ok(())
    }

    async fn load_file(&self, path: &Path) -> Option<SessionInfo> {
        let contents = fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&contents) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(path = ?path, error = %e, "Malformed session file, treating as not found");
                None
            }
        }
    }

    async fn delete_file(&self, session_id: &str) -> ProxyResult<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.session_path(session_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProxyError::internal_error(format!(
                "failed to delete session file: {e}"
            ))),
        }
    }

    async fn load_all(&self) -> Vec<SessionInfo> {
        let mut sessions = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.storage_path).await else {
            return sessions;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(session) = self.load_file(&path).await {
                sessions.push(session);
            }
        }
        sessions
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(
        &self,
        agent_id: &str,
        correlation_id: Option<String>,
        ttl_seconds: Option<i64>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> ProxyResult<SessionInfo> {
        let mut session = SessionInfo::new(Uuid::new_v4().to_string(), agent_id);
        session.correlation_id = correlation_id;
        session.metadata = metadata;
        if let Some(ttl) = ttl_seconds {
            session.extend_ttl(ttl);
        }
        self.save_file(&session).await?;
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> ProxyResult<Option<SessionInfo>> {
        Ok(self.load_file(&self.session_path(session_id)).await)
    }

    async fn update(&self, session: &SessionInfo) -> ProxyResult<bool> {
        if self
            .load_file(&self.session_path(&session.session_id))
            .await
            .is_none()
        {
            return Ok(false);
        }
        self.save_file(session).await?;
        Ok(true)
    }

    async fn delete(&self, session_id: &str) -> ProxyResult<bool> {
        self.delete_file(session_id).await
    }

    async fn list(
        &self,
        agent_id: Option<&str>,
        include_expired: bool,
    ) -> ProxyResult<Vec<SessionInfo>> {
        let mut sessions = self.load_all().await;
        sessions.retain(|s| {
            if let Some(agent) = agent_id {
                if s.agent_id != agent {
                    return false;
                }
            }
            include_expired || !s.is_expired()
        });
        Ok(sessions)
    }

    async fn cleanup_expired(&self) -> ProxyResult<usize> {
        let mut removed = 0;
        for session in self.load_all().await {
            if session.is_expired() && self.delete_file(&session.session_id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> ProxyResult<SessionStats> {
        let sessions = self.load_all().await;
        let total_sessions = sessions.len();
        let active: Vec<&SessionInfo> = sessions.iter().filter(|s| !s.is_expired()).collect();
        let mut sessions_by_agent: HashMap<String, usize> = HashMap::new();
        for session in &active {
            *sessions_by_agent.entry(session.agent_id.clone()).or_default() += 1;
        }
        Ok(SessionStats {
            total_sessions,
            active_sessions: active.len(),
            expired_sessions: total_sessions - active.len(),
            sessions_by_agent,
        })
    }

    async fn get_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> ProxyResult<Option<SessionInfo>> {
        Ok(self
            .load_all()
            .await
            .into_iter()
            .find(|s| !s.is_expired() && s.correlation_id.as_deref() == Some(correlation_id)))
    }
}
