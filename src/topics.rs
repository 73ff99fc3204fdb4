//! Topic lifecycle management (coordinator only).
//!
//! Declaratively reconciles the per-group topic triple
//! (`a2a.{group}.requests` / `.responses` / `.deadletter`) against the
//! bus's current state: absent topics are created, drifted topics are
//! updated, matching topics are reported as existing. All administrative
//! calls are wrapped in bounded exponential-backoff retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::{AdminError, BusAdmin, TopicProperties};
use crate::config::TopicGroupConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::types::{deadletter_topic, request_topic, response_topic, MANAGED_TOPIC_PREFIX};

/// Retry policy for administrative operations.
const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// Outcome of reconciling one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    /// Topic was absent and has been created.
    Created,
    /// Topic existed with drifted properties and has been updated.
    Updated,
    /// Topic existed with matching properties.
    Exists,
    /// Reconciliation failed; terminal for this pass.
    Failed,
}

/// Health classification of a group's topic triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicHealthStatus {
    /// All three topics present.
    Healthy,
    /// Probe errors, but at least one topic present.
    Degraded,
    /// One or more topics missing.
    Unhealthy,
}

/// Result of one topic reconciliation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicOpResult {
    /// Topic the operation targeted.
    pub topic_name: String,
    /// Outcome.
    pub status: TopicStatus,
    /// Human-readable detail.
    pub message: String,
    /// Error detail when `status` is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of reconciling a group's full topic triple.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSetResult {
    /// The group reconciled.
    pub group_name: String,
    /// Request-topic outcome.
    pub request_topic: TopicOpResult,
    /// Response-topic outcome.
    pub response_topic: TopicOpResult,
    /// Dead-letter-topic outcome.
    pub deadletter_topic: TopicOpResult,
}

impl TopicSetResult {
    /// All three topics created, updated, or already existing.
    pub fn is_successful(&self) -> bool {
        [
            &self.request_topic,
            &self.response_topic,
            &self.deadletter_topic,
        ]
        .iter()
        .all(|r| r.status != TopicStatus::Failed)
    }
}

/// Health probe result for a group's topic triple.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicHealth {
    /// The probed group.
    pub group_name: String,
    /// Overall classification.
    pub status: TopicHealthStatus,
    /// Per-topic presence.
    pub topics: HashMap<String, bool>,
    /// Probe errors, when any.
    pub errors: Vec<String>,
}

/// Manages Service Bus topics for agent groups.
pub struct TopicManager {
    admin: Arc<dyn BusAdmin>,
}

impl TopicManager {
    /// Create a manager over the given admin surface.
    pub fn new(admin: Arc<dyn BusAdmin>) -> Self {
        Self { admin }
    }

    /// Reconcile topics for all configured groups concurrently.
    pub async fn ensure_topics_exist(
        &self,
        groups: &[TopicGroupConfig],
    ) -> HashMap<String, TopicSetResult> {
        if groups.is_empty() {
            info!("No agent groups configured for topic management");
            return HashMap::new();
        }
        info!(groups = groups.len(), "Ensuring topics exist");

        let results = join_all(groups.iter().map(|g| self.create_topic_set(g))).await;
        let mut by_group = HashMap::new();
        for result in results {
            if result.is_successful() {
                info!(group = %result.group_name, "Topic set ensured");
            } else {
                warn!(group = %result.group_name, "Some topics failed");
            }
            by_group.insert(result.group_name.clone(), result);
        }
        by_group
    }

    /// Reconcile the request/response/deadletter triple for one group.
    /// The three reconciliations run concurrently.
    pub async fn create_topic_set(&self, group: &TopicGroupConfig) -> TopicSetResult {
        info!(group = %group.name, "Creating topic set");
        let props = TopicProperties::from_group(group);
        let (request, response, deadletter) = tokio::join!(
            self.reconcile_topic(request_topic(&group.name), props.clone()),
            self.reconcile_topic(response_topic(&group.name), props.clone()),
            self.reconcile_topic(deadletter_topic(&group.name), props),
        );

        TopicSetResult {
            group_name: group.name.clone(),
            request_topic: request,
            response_topic: response,
            deadletter_topic: deadletter,
        }
    }

    /// `Unknown → Created | Updated | Exists | Failed` for one topic.
    async fn reconcile_topic(&self, topic_name: String, props: TopicProperties) -> TopicOpResult {
        match self
            .with_retry(|| self.admin.get_topic(&topic_name))
            .await
        {
            Ok(existing) => {
                if props.differs_from(&existing) {
                    match self
                        .with_retry(|| self.admin.update_topic(&topic_name, &props))
                        .await
                    {
                        Ok(()) => {
                            info!(topic = %topic_name, "Topic updated");
                            TopicOpResult {
                                topic_name,
                                status: TopicStatus::Updated,
                                message: "Topic properties updated".to_string(),
                                error: None,
                            }
                        }
                        Err(e) => failed(topic_name, e),
                    }
                } else {
                    debug!(topic = %topic_name, "Topic already exists with correct properties");
                    TopicOpResult {
                        topic_name,
                        status: TopicStatus::Exists,
                        message: "Topic already exists with correct properties".to_string(),
                        error: None,
                    }
                }
            }
            Err(AdminError::NotFound) => {
                match self
                    .with_retry(|| self.admin.create_topic(&topic_name, &props))
                    .await
                {
                    Ok(()) => {
                        info!(topic = %topic_name, "Topic created");
                        TopicOpResult {
                            topic_name,
                            status: TopicStatus::Created,
                            message: "Topic created successfully".to_string(),
                            error: None,
                        }
                    }
                    // Lost a create race; the other creator's topic serves.
                    Err(AdminError::AlreadyExists) => TopicOpResult {
                        topic_name,
                        status: TopicStatus::Exists,
                        message: "Topic already exists".to_string(),
                        error: None,
                    },
                    Err(e) => failed(topic_name, e),
                }
            }
            Err(e) => failed(topic_name, e),
        }
    }

    /// Probe the existence of all three topics for a group.
    pub async fn validate_topic_health(&self, group_name: &str) -> TopicHealth {
        debug!(group = %group_name, "Validating topic health");
        let names = [
            request_topic(group_name),
            response_topic(group_name),
            deadletter_topic(group_name),
        ];

        let mut topics = HashMap::new();
        let mut errors = Vec::new();
        let mut missing = false;
        let mut errored = false;
        for name in names {
            match self.with_retry(|| self.admin.get_topic(&name)).await {
                Ok(_) => {
                    topics.insert(name, true);
                }
                Err(AdminError::NotFound) => {
                    warn!(topic = %name, "Topic not found");
                    errors.push(format!("Topic {name} not found"));
                    topics.insert(name, false);
                    missing = true;
                }
                Err(e) => {
                    warn!(topic = %name, error = %e, "Topic probe failed");
                    errors.push(format!("Topic {name} error: {e}"));
                    topics.insert(name, false);
                    errored = true;
                }
            }
        }

        let status = if missing {
            TopicHealthStatus::Unhealthy
        } else if errored {
            TopicHealthStatus::Degraded
        } else {
            TopicHealthStatus::Healthy
        };
        TopicHealth {
            group_name: group_name.to_string(),
            status,
            topics,
            errors,
        }
    }

    /// All topics under the managed `a2a.` prefix, sorted.
    pub async fn list_managed_topics(&self) -> ProxyResult<Vec<String>> {
        let all = self
            .with_retry(|| self.admin.list_topics())
            .await
            .map_err(|e| ProxyError::internal_error(format!("failed to list topics: {e}")))?;
        let mut managed: Vec<String> = all
            .into_iter()
            .filter(|name| name.starts_with(MANAGED_TOPIC_PREFIX))
            .collect();
        managed.sort();
        debug!(count = managed.len(), "Managed topics listed");
        Ok(managed)
    }

    /// Delete the group's topic triple. Missing topics count as deleted.
    pub async fn delete_topic_set(&self, group_name: &str) -> HashMap<String, bool> {
        warn!(group = %group_name, "Deleting topic set");
        let names = [
            request_topic(group_name),
            response_topic(group_name),
            deadletter_topic(group_name),
        ];
        let mut results = HashMap::new();
        for name in names {
            let deleted = match self.with_retry(|| self.admin.delete_topic(&name)).await {
                Ok(()) => {
                    info!(topic = %name, "Topic deleted");
                    true
                }
                Err(AdminError::NotFound) => {
                    info!(topic = %name, "Topic already deleted");
                    true
                }
                Err(e) => {
                    warn!(topic = %name, error = %e, "Failed to delete topic");
                    false
                }
            };
            results.insert(name, deleted);
        }
        results
    }

    /// Destructive recreate: delete the triple, then create it fresh.
    pub async fn recreate(&self, group: &TopicGroupConfig) -> (HashMap<String, bool>, TopicSetResult) {
        let deleted = self.delete_topic_set(&group.name).await;
        let created = self.create_topic_set(group).await;
        (deleted, created)
    }

    /// Execute an admin operation with exponential-backoff retry.
    ///
    /// `NotFound` and `AlreadyExists` are answers, not faults — they pass
    /// through without retrying.
    async fn with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, AdminError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AdminError>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut last_err = AdminError::Failed("no attempts made".to_string());
        for attempt in 1..=RETRY_MAX_ATTEMPTS {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e @ (AdminError::NotFound | AdminError::AlreadyExists)) => return Err(e),
                Err(e) => {
                    if attempt < RETRY_MAX_ATTEMPTS {
                        warn!(
                            attempt,
                            retry_in_secs = delay.as_secs(),
                            error = %e,
                            "Admin operation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(RETRY_MAX_DELAY);
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

fn failed(topic_name: String, err: AdminError) -> TopicOpResult {
    TopicOpResult {
        topic_name,
        status: TopicStatus::Failed,
        message: "Topic operation failed".to_string(),
        error: Some(err.to_string()),
    }
}
