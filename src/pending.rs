//! Pending-request correlator — correlation-id keyed one-shot promises.
//!
//! Every remote route registers a pending entry before publishing; the
//! subscriber completes it when the correlated response arrives. A promise
//! resolves exactly once: the first of {response, timeout, shutdown, error}
//! wins and later completions observe `false`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};

/// Default sweeper cadence in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// One in-flight request awaiting its correlated response.
struct PendingEntry {
    created_at: DateTime<Utc>,
    timeout_seconds: i64,
    metadata: HashMap<String, Value>,
    /// Armed by `wait`; taken by whichever completion path wins.
    tx: Option<oneshot::Sender<ProxyResult<Value>>>,
    /// Holds the result when completion happens before any waiter arrives.
    result: Option<ProxyResult<Value>>,
    completed: bool,
}

impl PendingEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.completed && now > self.created_at + chrono::Duration::seconds(self.timeout_seconds)
    }

    /// Resolve the promise. Returns false if something else already won.
    fn complete(&mut self, result: ProxyResult<Value>) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        match self.tx.take() {
            // A dropped receiver just means nobody is waiting anymore.
            Some(tx) => {
                let _ = tx.send(result);
            }
            // Buffer for a waiter that hasn't arrived yet.
            None => self.result = Some(result),
        }
        true
    }
}

/// Read-only snapshot of a pending entry, for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingRequestInfo {
    /// Correlation id of the entry.
    pub correlation_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Per-request timeout.
    pub timeout_seconds: i64,
    /// Caller-supplied metadata.
    pub metadata: HashMap<String, Value>,
    /// Whether a completion path has already won.
    pub is_completed: bool,
    /// Whether the entry is past its deadline.
    pub is_expired: bool,
}

/// Manages pending requests and correlates responses arriving off the bus.
///
/// The mapping is mutated concurrently (router task, subscriber tasks,
/// sweeper) and sits behind a single mutex; each entry's promise is
/// written at most once.
pub struct PendingRequestManager {
    cleanup_interval: Duration,
    entries: Arc<Mutex<HashMap<String, PendingEntry>>>,
    running: Arc<Mutex<bool>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PendingRequestManager {
    /// Create a manager with the default 60 s sweep cadence.
    pub fn new() -> Self {
        Self::with_cleanup_interval(Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS))
    }

    /// Create a manager with a custom sweep cadence.
    pub fn with_cleanup_interval(cleanup_interval: Duration) -> Self {
        Self {
            cleanup_interval,
            entries: Arc::new(Mutex::new(HashMap::new())),
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

        let entries = Arc::clone(&self.entries);
        let running = Arc::clone(&self.running);
        let interval = self.cleanup_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !*running.lock().await {
                    break;
                }
                sweep_expired(&entries).await;
            }
        });
        *self.sweeper.lock().await = Some(handle);
        info!(
            cleanup_interval_secs = self.cleanup_interval.as_secs(),
            "Pending request manager started"
        );
    }

    /// Stop the sweeper and reject every outstanding entry with a shutdown
    /// error. Idempotent.
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

        let mut entries = self.entries.lock().await;
        for (correlation_id, entry) in entries.iter_mut() {
            if entry.complete(Err(ProxyError::Shutdown(format!(
                "pending request {correlation_id} abandoned on shutdown"
            )))) {
                debug!(correlation_id = %correlation_id, "Pending request failed on shutdown");
            }
        }
        entries.clear();
        info!("Pending request manager stopped");
    }

    /// Register a new pending request. An existing entry under the same id
    /// is overwritten (dropped, not completed) with a warning.
    pub async fn create(
        &self,
        correlation_id: &str,
        timeout_seconds: i64,
        metadata: HashMap<String, Value>,
    ) -> ProxyResult<()> {
        if !*self.running.lock().await {
            return Err(ProxyError::Shutdown(
                "pending request manager is not running".to_string(),
            ));
        }

        let mut entries = self.entries.lock().await;
        if entries.contains_key(correlation_id) {
            warn!(correlation_id = %correlation_id, "Pending request already exists, overwriting");
        }
        entries.insert(
            correlation_id.to_string(),
            PendingEntry {
                created_at: Utc::now(),
                timeout_seconds,
                metadata,
                tx: None,
                result: None,
                completed: false,
            },
        );
        debug!(
            correlation_id = %correlation_id,
            timeout_seconds,
            "Created pending request"
        );
        Ok(())
    }

    /// Await the response for a pending request.
    ///
    /// Fails with `TaskNotFound` if no entry exists, with `Timeout` if the
    /// entry is already past its deadline or expires during the wait. The
    /// entry is removed on every outcome.
    pub async fn wait(&self, correlation_id: &str) -> ProxyResult<Value> {
        let (rx, remaining) = {
            let mut entries = self.entries.lock().await;
            let entry = entries.get_mut(correlation_id).ok_or_else(|| {
                ProxyError::task_not_found(format!(
                    "no pending request for correlation id {correlation_id}"
                ))
            })?;

            // Completion already happened; hand over the buffered result.
            if entry.completed {
                let result = entry.result.take().unwrap_or_else(|| {
                    Err(ProxyError::Shutdown(format!(
                        "pending request {correlation_id} abandoned"
                    )))
                });
                entries.remove(correlation_id);
                return result;
            }

            let now = Utc::now();
            if entry.is_expired(now) {
                entry.complete(Err(ProxyError::timeout(format!(
                    "request {correlation_id} timed out"
                ))));
                entries.remove(correlation_id);
                return Err(ProxyError::timeout(format!(
                    "request {correlation_id} timed out"
                )));
            }

            // Arm the promise with a channel whose receiver we hold.
            let (tx, rx) = oneshot::channel();
            entry.tx = Some(tx);
            let deadline = entry.created_at + chrono::Duration::seconds(entry.timeout_seconds);
            let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
            (rx, remaining)
        };

        let outcome = tokio::time::timeout(remaining, rx).await;
        self.entries.lock().await.remove(correlation_id);

        match outcome {
            Ok(Ok(result)) => {
                debug!(correlation_id = %correlation_id, "Response received for pending request");
                result
            }
            // Sender dropped without a result; treat as shutdown.
            Ok(Err(_)) => Err(ProxyError::Shutdown(format!(
                "pending request {correlation_id} abandoned"
            ))),
            Err(_) => Err(ProxyError::timeout(format!(
                "request {correlation_id} timed out"
            ))),
        }
    }

    /// Correlate an incoming response with a pending request.
    ///
    /// Returns true iff a live entry was found and this call won the
    /// completion race.
    pub async fn handle_response(&self, correlation_id: &str, response: Value) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(correlation_id) else {
            debug!(correlation_id = %correlation_id, "No pending request for response");
            return false;
        };
        if entry.completed {
            warn!(correlation_id = %correlation_id, "Pending request already completed");
            return false;
        }
        let won = entry.complete(Ok(response));
        debug!(correlation_id = %correlation_id, "Response correlated with pending request");
        won
    }

    /// Reject a pending request with an error. Returns true iff this call
    /// won the completion race.
    pub async fn handle_error(&self, correlation_id: &str, err: ProxyError) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(correlation_id) {
            Some(entry) => entry.complete(Err(err)),
            None => false,
        }
    }

    /// Drop a pending entry without completing it (e.g. after a failed
    /// publish, when nothing will ever answer).
    pub async fn cancel(&self, correlation_id: &str) {
        self.entries.lock().await.remove(correlation_id);
    }

    /// Number of outstanding entries.
    pub async fn pending_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Diagnostic snapshot of one entry.
    pub async fn request_info(&self, correlation_id: &str) -> Option<PendingRequestInfo> {
        let entries = self.entries.lock().await;
        let entry = entries.get(correlation_id)?;
        Some(PendingRequestInfo {
            correlation_id: correlation_id.to_string(),
            created_at: entry.created_at,
            timeout_seconds: entry.timeout_seconds,
            metadata: entry.metadata.clone(),
            is_completed: entry.completed,
            is_expired: entry.is_expired(Utc::now()),
        })
    }
}

impl Default for PendingRequestManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject and remove every expired entry.
async fn sweep_expired(entries: &Mutex<HashMap<String, PendingEntry>>) {
    let now = Utc::now();
    let mut entries = entries.lock().await;
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, e)| e.is_expired(now))
        .map(|(id, _)| id.clone())
        .collect();

    if expired.is_empty() {
        return;
    }
    info!(count = expired.len(), "Cleaning up expired pending requests");
    for correlation_id in expired {
        if let Some(mut entry) = entries.remove(&correlation_id) {
            entry.complete(Err(ProxyError::timeout(format!(
                "request {correlation_id} timed out"
            ))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_before_start_fails() {
        let mgr = PendingRequestManager::new();
        let err = mgr.create("c-1", 30, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Shutdown(_)));
    }

    #[tokio::test]
    async fn response_wins_over_wait() {
        let mgr = Arc::new(PendingRequestManager::new());
        mgr.start().await;
        mgr.create("c-1", 30, HashMap::new()).await.unwrap();

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.wait("c-1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mgr.handle_response("c-1", serde_json::json!({"ok": true})).await);

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(mgr.pending_count().await, 0);
        mgr.stop().await;
    }

    #[tokio::test]
    async fn response_before_wait_is_buffered() {
        let mgr = PendingRequestManager::new();
        mgr.start().await;
        mgr.create("c-1", 30, HashMap::new()).await.unwrap();
        assert!(mgr.handle_response("c-1", serde_json::json!(42)).await);

        let result = mgr.wait("c-1").await.unwrap();
        assert_eq!(result, serde_json::json!(42));
        assert_eq!(mgr.pending_count().await, 0);
        mgr.stop().await;
    }

    #[tokio::test]
    async fn second_response_loses() {
        let mgr = PendingRequestManager::new();
        mgr.start().await;
        mgr.create("c-1", 30, HashMap::new()).await.unwrap();
        assert!(mgr.handle_response("c-1", Value::Null).await);
        assert!(!mgr.handle_response("c-1", Value::Null).await);
        mgr.stop().await;
    }

    #[tokio::test]
    async fn stop_rejects_outstanding_entries() {
        let mgr = Arc::new(PendingRequestManager::new());
        mgr.start().await;
        mgr.create("c-1", 30, HashMap::new()).await.unwrap();
        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.wait("c-1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.stop().await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::Shutdown(_)));
        assert_eq!(mgr.pending_count().await, 0);
    }
}
