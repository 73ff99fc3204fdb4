//! Subscriber orchestration — durable subscriptions and arrival dispatch.
//!
//! At startup the orchestrator creates one receiver per configured
//! `{group, filter}` pair plus a response subscription per group filtered
//! to `toProxy = '<this proxy>'`, so replies come home to the proxy that
//! originated the request. Arrivals dispatch exhaustively on the message
//! type: responses feed the pending-request correlator, requests are
//! forwarded over HTTP to the locally hosted agent and answered onto the
//! group's response topic.

use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SubscriptionConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::pending::PendingRequestManager;
use crate::registry::AgentRegistry;
use crate::types::{request_topic, response_topic, WireProtocol, NOTIFICATION_TOPIC};

use super::admin::BusAdmin;
use super::filter::to_agent_target;
use super::{BusClient, BusMessage, MessageHandler, MessagePublisher, MessageType, SubscriptionSpec};

/// Deterministic durable-subscription name for a `{group, filter}` pair.
///
/// Stable names let a restarted proxy re-attach to its subscriptions
/// instead of leaking new ones:
/// - filter pins an agent (`toAgent = 'x'`) → `{proxy}-{group}-{x}`
/// - the notifications group → `{proxy}-notifications`
/// - otherwise → `{proxy}-{group}-requests`
pub fn subscription_name(proxy_id: &str, group: &str, filter: &str) -> String {
    if let Some(agent_id) = to_agent_target(filter) {
        return format!("{proxy_id}-{group}-{agent_id}");
    }
    if group == "notifications" {
        return format!("{proxy_id}-notifications");
    }
    format!("{proxy_id}-{group}-requests")
}

/// Topic a configured subscription attaches to.
fn subscription_topic(group: &str) -> String {
    if group == "notifications" {
        NOTIFICATION_TOPIC.to_string()
    } else {
        request_topic(group)
    }
}

struct SubscriberContext {
    proxy_id: String,
    bus: Arc<dyn BusClient>,
    registry: Arc<AgentRegistry>,
    publisher: Arc<MessagePublisher>,
    pending: Arc<PendingRequestManager>,
    http: reqwest::Client,
}

/// Creates the per-proxy subscriptions and dispatches arrivals.
///
/// Constructed with explicit references to its collaborators; holds no
/// globals.
pub struct SubscriberOrchestrator {
    ctx: Arc<SubscriberContext>,
    subscriptions: Vec<SubscriptionConfig>,
}

impl SubscriberOrchestrator {
    /// Wire up the orchestrator.
    pub fn new(
        proxy_id: impl Into<String>,
        subscriptions: Vec<SubscriptionConfig>,
        bus: Arc<dyn BusClient>,
        registry: Arc<AgentRegistry>,
        publisher: Arc<MessagePublisher>,
        pending: Arc<PendingRequestManager>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                crate::types::DEFAULT_REQUEST_TIMEOUT_SECS,
            ))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            ctx: Arc::new(SubscriberContext {
                proxy_id: proxy_id.into(),
                bus,
                registry,
                publisher,
                pending,
                http,
            }),
            subscriptions,
        }
    }

    /// The specs this proxy subscribes with: one per configured
    /// `{group, filter}`, plus a `toProxy`-filtered response subscription
    /// per non-notification group.
    pub fn subscription_specs(&self) -> Vec<SubscriptionSpec> {
        let proxy_id = &self.ctx.proxy_id;
        let mut specs = Vec::new();
        for sub in &self.subscriptions {
            let name = subscription_name(proxy_id, &sub.group, &sub.filter);
            specs.push(
                SubscriptionSpec::new(name, subscription_topic(&sub.group))
                    .with_filter(sub.filter.clone()),
            );
        }

        let mut groups: Vec<&str> = self
            .subscriptions
            .iter()
            .map(|s| s.group.as_str())
            .filter(|g| *g != "notifications")
            .collect();
        groups.sort_unstable();
        groups.dedup();
        for group in groups {
            // Replies carry toProxy = originator; filter on ourselves.
            specs.push(
                SubscriptionSpec::new(
                    format!("{proxy_id}-responses-{group}"),
                    response_topic(group),
                )
                .with_filter(format!("toProxy = '{proxy_id}'")),
            );
        }
        specs
    }

    /// Provision the durable subscriptions (and their filter rules)
    /// through the broker's management surface. Idempotent; failures are
    /// logged per subscription and do not abort the rest.
    pub async fn provision(&self, admin: &dyn BusAdmin) -> usize {
        let mut provisioned = 0;
        for spec in self.subscription_specs() {
            match admin.create_subscription(&spec.topic_name, &spec).await {
                Ok(()) => provisioned += 1,
                Err(e) => {
                    warn!(
                        subscription = %spec.name,
                        topic = %spec.topic_name,
                        error = %e,
                        "Failed to provision subscription"
                    );
                }
            }
        }
        provisioned
    }

    /// Attach receive loops for every subscription.
    pub async fn start(&self) -> ProxyResult<()> {
        for spec in self.subscription_specs() {
            let handler = self.make_handler();
            let name = spec.name.clone();
            if self.ctx.bus.create_subscription(spec, handler).await {
                info!(subscription = %name, "Subscriber attached");
            } else {
                warn!(subscription = %name, "Failed to attach subscriber");
            }
        }
        Ok(())
    }

    fn make_handler(&self) -> MessageHandler {
        let ctx = Arc::clone(&self.ctx);
        Arc::new(move |message| {
            let ctx = Arc::clone(&ctx);
            Box::pin(async move { dispatch(ctx, message).await })
        })
    }
}

/// Route one bus arrival by its message type.
async fn dispatch(ctx: Arc<SubscriberContext>, message: BusMessage) -> ProxyResult<()> {
    match message.message_type {
        MessageType::Response => handle_response(ctx, message).await,
        MessageType::Request => handle_request(ctx, message).await,
        MessageType::Notification => {
            debug!(
                correlation_id = %message.correlation_id,
                from_proxy = %message.envelope.from_proxy,
                "Notification received"
            );
            Ok(())
        }
        MessageType::Heartbeat => {
            debug!(from_proxy = %message.envelope.from_proxy, "Heartbeat received");
            Ok(())
        }
    }
}

/// Hand a correlated response to the pending-request correlator.
async fn handle_response(ctx: Arc<SubscriberContext>, message: BusMessage) -> ProxyResult<()> {
    let payload: serde_json::Value = serde_json::from_slice(&message.payload)
        .unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned())
        });
    let value = serde_json::json!({
        "statusCode": message.envelope.status_code.unwrap_or(200),
        "body": payload,
        "isSSE": message.envelope.is_sse,
    });

    if ctx
        .pending
        .handle_response(&message.correlation_id, value)
        .await
    {
        debug!(
            correlation_id = %message.correlation_id,
            "Response delivered to pending request"
        );
    } else {
        // Late or duplicate reply; nothing is waiting. Drop it.
        debug!(
            correlation_id = %message.correlation_id,
            "No pending request for response, dropping"
        );
    }
    Ok(())
}

/// Forward a routed request to the locally hosted agent and publish the
/// reply onto the group's response topic.
async fn handle_request(ctx: Arc<SubscriberContext>, message: BusMessage) -> ProxyResult<()> {
    let envelope = &message.envelope;
    let agent = ctx.registry.get(&envelope.to_agent).await.ok_or_else(|| {
        warn!(agent_id = %envelope.to_agent, "Request for unknown agent");
        ProxyError::agent_not_found(&envelope.to_agent)
    })?;

    let is_local = agent.proxy_id == ctx.proxy_id && agent.fqdn.is_some();
    if !is_local {
        // Misrouted: redelivery will dead-letter it eventually.
        warn!(
            agent_id = %agent.id,
            owning_proxy = %agent.proxy_id,
            "Request for agent not hosted here"
        );
        return Err(ProxyError::agent_unavailable(format!(
            "agent {} is not hosted by proxy {}",
            agent.id, ctx.proxy_id
        )));
    }
    let fqdn = agent.fqdn.as_deref().unwrap_or_default();

    let url = format!("http://{}{}", fqdn, envelope.path);
    let method = reqwest::Method::from_str(&envelope.method)
        .unwrap_or(reqwest::Method::POST);

    debug!(
        agent_id = %agent.id,
        method = %envelope.method,
        url = %url,
        correlation_id = %message.correlation_id,
        "Forwarding bus request to local agent"
    );

    let mut req = ctx.http.request(method, &url);
    for (key, value) in &envelope.headers {
        // Hop-by-hop headers would confuse the downstream server.
        if key.eq_ignore_ascii_case("host") || key.eq_ignore_ascii_case("content-length") {
            continue;
        }
        req = req.header(key, value);
    }
    req = req.header("X-Correlation-ID", &message.correlation_id);
    if !envelope.query_params.is_empty() {
        req = req.query(&envelope.query_params);
    }
    if !message.payload.is_empty() {
        req = req.body(message.payload.clone());
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
    let body = resp.text().await.unwrap_or_default();

    let mut reply = envelope.reply(&ctx.proxy_id, status);
    if content_type.contains("text/event-stream") {
        reply.is_sse = true;
        reply.protocol = WireProtocol::Sse;
    }

    let published = ctx
        .publisher
        .publish_response(
            reply,
            body.into_bytes(),
            &agent.group,
            &message.correlation_id,
            None,
        )
        .await;
    if !published {
        return Err(ProxyError::internal_error(format!(
            "failed to publish response for {}",
            message.correlation_id
        )));
    }

    info!(
        agent_id = %agent.id,
        status,
        correlation_id = %message.correlation_id,
        "Bus request answered"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_naming_rules() {
        assert_eq!(
            subscription_name("proxy-1", "review", "toAgent = 'critic'"),
            "proxy-1-review-critic"
        );
        assert_eq!(
            subscription_name("proxy-1", "notifications", ""),
            "proxy-1-notifications"
        );
        assert_eq!(
            subscription_name("proxy-1", "review", ""),
            "proxy-1-review-requests"
        );
        assert_eq!(
            subscription_name("proxy-1", "review", "fromProxy = 'proxy-2'"),
            "proxy-1-review-requests"
        );
    }

    #[test]
    fn subscription_topics() {
        assert_eq!(subscription_topic("review"), "a2a.review.requests");
        assert_eq!(subscription_topic("notifications"), "a2a-notifications");
    }
}
