//! Messaging layer — abstracts a topic-based broker.
//!
//! The proxy consumes the bus through [`BusClient`]: publish, subscribe
//! with a server-side filter, lifecycle, restart. Two implementations
//! exist: [`AzureBusClient`] over the Azure Service Bus REST data plane,
//! and [`InMemoryBus`] for tests and local development.

mod admin;
mod azure;
mod filter;
mod memory;
mod publisher;
mod subscriber;

pub use admin::{AdminError, AzureBusAdmin, BusAdmin, TopicProperties};
pub use azure::AzureBusClient;
pub use filter::filter_matches;
pub use memory::{InMemoryBus, InMemoryBusAdmin};
pub use publisher::MessagePublisher;
pub use subscriber::{subscription_name, SubscriberOrchestrator};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};
use crate::types::MessageEnvelope;

/// Restart budget of a supervised receive loop.
pub const MAX_SUBSCRIPTION_RESTARTS: u32 = 5;

/// Base delay between receive-loop restarts, seconds.
pub const RESTART_BASE_DELAY_SECS: u64 = 5;

/// Cap on the exponential restart delay, seconds.
pub const RESTART_MAX_DELAY_SECS: u64 = 80;

/// Idle pause after a receive pass ends without error, seconds.
pub const IDLE_RESTART_DELAY_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Kind of a bus-borne message, dispatched exhaustively at the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A routed request awaiting a correlated response.
    Request,
    /// The correlated response to a request.
    Response,
    /// Fire-and-forget broadcast on the shared notification topic.
    Notification,
    /// Liveness signal; accepted on the wire, ignored by this proxy.
    Heartbeat,
}

impl MessageType {
    /// Wire value used in broker application properties.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
            MessageType::Heartbeat => "heartbeat",
        }
    }

    /// Parse the wire value; unknown strings default to `Request` the way
    /// the broker-side default rule does.
    pub fn parse(s: &str) -> Self {
        match s {
            "response" => MessageType::Response,
            "notification" => MessageType::Notification,
            "heartbeat" => MessageType::Heartbeat,
            _ => MessageType::Request,
        }
    }
}

/// Internal wrapper around an envelope as carried by the broker.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Unique broker message id (duplicate-detection key).
    pub message_id: String,
    /// Correlation id, mirrored from the envelope.
    pub correlation_id: String,
    /// Message kind.
    pub message_type: MessageType,
    /// Routing + metadata header.
    pub envelope: MessageEnvelope,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry, derived from the envelope's TTL.
    pub expires_at: Option<DateTime<Utc>>,
    /// Times this message has been redelivered.
    pub retry_count: u32,
    /// Broker application properties used for server-side filtering.
    pub properties: HashMap<String, String>,
}

impl BusMessage {
    /// Wrap an envelope + payload as a new bus message of the given type.
    /// The envelope's TTL sets the message expiry.
    pub fn new(message_type: MessageType, envelope: MessageEnvelope, payload: Vec<u8>) -> Self {
        let correlation_id = envelope.correlation_id.clone();
        let created_at = Utc::now();
        let expires_at = Some(created_at + chrono::Duration::seconds(envelope.ttl));
        let mut msg = Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id,
            message_type,
            envelope,
            payload,
            created_at,
            expires_at,
            retry_count: 0,
            properties: HashMap::new(),
        };
        msg.properties = msg.broker_properties();
        msg
    }

    /// Whether the message has outlived its expiry.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => Utc::now() > expires,
            None => false,
        }
    }

    /// The application properties surfaced to the broker for server-side
    /// filter evaluation.
    pub fn broker_properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        props.insert(
            "messageType".to_string(),
            self.message_type.as_str().to_string(),
        );
        props.insert("toAgent".to_string(), self.envelope.to_agent.clone());
        props.insert(
            "fromAgent".to_string(),
            self.envelope.from_agent.clone().unwrap_or_default(),
        );
        props.insert("fromProxy".to_string(), self.envelope.from_proxy.clone());
        if let Some(to_proxy) = &self.envelope.to_proxy {
            props.insert("toProxy".to_string(), to_proxy.clone());
        }
        props
    }

    /// Serialize the wire body: envelope + payload as one JSON document.
    pub fn to_wire_body(&self) -> ProxyResult<String> {
        let body = serde_json::json!({
            "envelope": self.envelope,
            "payload": String::from_utf8_lossy(&self.payload),
        });
        Ok(serde_json::to_string(&body)?)
    }

    /// Parse a wire body back into envelope + payload.
    pub fn from_wire_body(
        message_id: String,
        message_type: MessageType,
        body: &str,
        properties: HashMap<String, String>,
    ) -> ProxyResult<Self> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| ProxyError::InvalidJson(format!("bus message body: {e}")))?;
        let envelope: MessageEnvelope = serde_json::from_value(
            value
                .get("envelope")
                .cloned()
                .ok_or_else(|| ProxyError::InvalidJson("missing envelope".to_string()))?,
        )
        .map_err(|e| ProxyError::InvalidJson(format!("bus envelope: {e}")))?;
        envelope.validate()?;
        let payload = value
            .get("payload")
            .and_then(|p| p.as_str())
            .unwrap_or_default()
            .as_bytes()
            .to_vec();
        let correlation_id = envelope.correlation_id.clone();
        // Expiry is anchored to the sender's timestamp, not receipt time.
        let expires_at = Some(envelope.timestamp + chrono::Duration::seconds(envelope.ttl));
        Ok(Self {
            message_id,
            correlation_id,
            message_type,
            envelope,
            payload,
            created_at: Utc::now(),
            expires_at,
            retry_count: 0,
            properties,
        })
    }
}

// ---------------------------------------------------------------------------
// Subscription spec
// ---------------------------------------------------------------------------

/// A durable subscription with an optional broker-side filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    /// Subscription name, deterministic per proxy (see
    /// [`subscription_name`]).
    pub name: String,
    /// Topic the subscription hangs off.
    pub topic_name: String,
    /// SQL filter predicate evaluated by the broker; `None` accepts all.
    pub filter_rule: Option<String>,
    /// Deliveries before the broker dead-letters a message.
    pub max_delivery_count: u32,
    /// Peek-lock duration, seconds.
    pub lock_duration_secs: u64,
    /// Message TTL on the subscription, seconds.
    pub default_message_ttl_secs: i64,
    /// Dead-letter expired messages rather than dropping them.
    pub dead_lettering_on_message_expiration: bool,
}

impl SubscriptionSpec {
    /// Spec with the operational defaults used across the proxy.
    pub fn new(name: impl Into<String>, topic_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic_name: topic_name.into(),
            filter_rule: None,
            max_delivery_count: 10,
            lock_duration_secs: 60,
            default_message_ttl_secs: 3600,
            dead_lettering_on_message_expiration: true,
        }
    }

    /// Attach a broker-side SQL filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        self.filter_rule = if filter.is_empty() { None } else { Some(filter) };
        self
    }
}

// ---------------------------------------------------------------------------
// Connection stats
// ---------------------------------------------------------------------------

/// Live connection counters, updated atomically.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connected: AtomicBool,
    connect_attempts: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_failed: AtomicU64,
    active_subscriptions: AtomicU64,
    subscriptions_gave_up: AtomicU64,
}

/// Serializable snapshot of [`ConnectionStats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Whether the client considers itself connected.
    pub connected: bool,
    /// Connection attempts so far.
    pub connect_attempts: u64,
    /// Messages accepted for publish.
    pub messages_sent: u64,
    /// Messages delivered to handlers and completed.
    pub messages_received: u64,
    /// Publish failures plus handler failures.
    pub messages_failed: u64,
    /// Currently supervised subscriptions.
    pub active_subscriptions: u64,
    /// Receive loops that exhausted their restart budget.
    pub subscriptions_gave_up: u64,
}

impl ConnectionStats {
    /// Record a connection attempt.
    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the client connected.
    pub fn record_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    /// Mark the client disconnected.
    pub fn record_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Count a successful publish.
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a completed delivery.
    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed publish or delivery.
    pub fn record_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Track subscription creation/teardown.
    pub fn adjust_subscriptions(&self, delta: i64) {
        if delta >= 0 {
            self.active_subscriptions
                .fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            self.active_subscriptions
                .fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
        }
    }

    /// Count a receive loop that exhausted its restart budget.
    pub fn record_gave_up(&self) {
        self.subscriptions_gave_up.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a consistent-enough snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
            subscriptions_gave_up: self.subscriptions_gave_up.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// BusClient trait
// ---------------------------------------------------------------------------

/// Async message handler invoked once per broker delivery attempt.
pub type MessageHandler =
    Arc<dyn Fn(BusMessage) -> BoxFuture<'static, ProxyResult<()>> + Send + Sync>;

/// Abstract interface hiding the broker.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Connect. Idempotent.
    async fn start(&self) -> ProxyResult<()>;

    /// Disconnect, closing receivers with best-effort error swallowing.
    /// Idempotent.
    async fn stop(&self);

    /// Publish one message. Returns true on accepted publish; failures are
    /// logged and counted, never raised.
    async fn send_message(
        &self,
        topic_name: &str,
        message: BusMessage,
        session_key: Option<&str>,
    ) -> bool;

    /// Publish a batch; returns the number of accepted messages.
    async fn send_batch(
        &self,
        topic_name: &str,
        messages: Vec<BusMessage>,
        session_key: Option<&str>,
    ) -> usize;

    /// Establish a receiver and start its supervised receive loop.
    /// Idempotent by subscription name.
    async fn create_subscription(&self, spec: SubscriptionSpec, handler: MessageHandler) -> bool;

    /// Cancel and close a subscription's receive loop.
    async fn delete_subscription(&self, subscription_name: &str, topic_name: &str) -> bool;

    /// Current connection counters.
    fn stats(&self) -> StatsSnapshot;
}

// ---------------------------------------------------------------------------
// Supervised receive loop
// ---------------------------------------------------------------------------

/// How a single receive pass ended.
pub enum ReceivePass {
    /// The pass drained and ended without error (broker idle).
    Idle,
    /// Shutdown was observed.
    Stopped,
}

/// Drive a receive pass under supervision: every abnormal exit becomes a
/// bounded-retry restart with exponential backoff.
///
/// Managed brokers silently reach terminal states on transient link
/// faults; a naive consumer wedges. The supervisor turns each failure into
/// `sleep(5·2^(n-1))` and a fresh receiver, up to
/// [`MAX_SUBSCRIPTION_RESTARTS`] attempts, then gives up (observable via
/// stats).
pub async fn run_supervised<F, Fut>(
    subscription_name: String,
    stats: Arc<ConnectionStats>,
    mut receive_pass: F,
) where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = ProxyResult<ReceivePass>> + Send,
{
    let mut restart_count: u32 = 0;
    loop {
        match receive_pass().await {
            Ok(ReceivePass::Stopped) => {
                info!(subscription = %subscription_name, "Receive loop stopped");
                break;
            }
            Ok(ReceivePass::Idle) => {
                // Natural idle end; pause briefly and keep listening.
                tokio::time::sleep(Duration::from_secs(IDLE_RESTART_DELAY_SECS)).await;
            }
            Err(e) => {
                restart_count += 1;
                if restart_count >= MAX_SUBSCRIPTION_RESTARTS {
                    error!(
                        subscription = %subscription_name,
                        error = %e,
                        restarts = restart_count,
                        "Max restart attempts reached, giving up"
                    );
                    stats.record_gave_up();
                    break;
                }
                let delay = (RESTART_BASE_DELAY_SECS << (restart_count - 1))
                    .min(RESTART_MAX_DELAY_SECS);
                warn!(
                    subscription = %subscription_name,
                    error = %e,
                    attempt = restart_count,
                    retry_in_secs = delay,
                    "Receive loop failed, restarting"
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trip() {
        for mt in [
            MessageType::Request,
            MessageType::Response,
            MessageType::Notification,
            MessageType::Heartbeat,
        ] {
            assert_eq!(MessageType::parse(mt.as_str()), mt);
        }
        assert_eq!(MessageType::parse("garbage"), MessageType::Request);
    }

    #[test]
    fn broker_properties_surface_routing_fields() {
        let mut env = MessageEnvelope::request("proxy-1", "writer", "/x", "c-1");
        env.from_agent = Some("critic".to_string());
        env.to_proxy = Some("proxy-2".to_string());
        let msg = BusMessage::new(MessageType::Response, env, b"{}".to_vec());

        let props = msg.broker_properties();
        assert_eq!(props["messageType"], "response");
        assert_eq!(props["toAgent"], "writer");
        assert_eq!(props["fromAgent"], "critic");
        assert_eq!(props["fromProxy"], "proxy-1");
        assert_eq!(props["toProxy"], "proxy-2");
    }

    #[test]
    fn new_message_expiry_follows_envelope_ttl() {
        let env = MessageEnvelope::request("proxy-1", "writer", "/x", "c-1")
            .with_ttl(60)
            .unwrap();
        let msg = BusMessage::new(MessageType::Request, env, Vec::new());
        let expires = msg.expires_at.unwrap();
        assert!(expires > msg.created_at);
        assert!(expires <= msg.created_at + chrono::Duration::seconds(60));
        assert!(!msg.is_expired());
    }

    #[test]
    fn received_message_expiry_anchors_to_sender_timestamp() {
        let mut env = MessageEnvelope::request("proxy-1", "writer", "/x", "c-1");
        env.timestamp = Utc::now() - chrono::Duration::seconds(10);
        env.ttl = 5;
        let body = BusMessage::new(MessageType::Request, env, Vec::new())
            .to_wire_body()
            .unwrap();

        let parsed = BusMessage::from_wire_body(
            "m-1".to_string(),
            MessageType::Request,
            &body,
            HashMap::new(),
        )
        .unwrap();
        assert!(parsed.is_expired());
    }

    #[test]
    fn wire_body_round_trip_preserves_payload() {
        let env = MessageEnvelope::request("proxy-1", "writer", "/x", "c-1");
        let msg = BusMessage::new(MessageType::Request, env, b"{\"k\":1}".to_vec());
        let body = msg.to_wire_body().unwrap();
        let parsed = BusMessage::from_wire_body(
            msg.message_id.clone(),
            MessageType::Request,
            &body,
            HashMap::new(),
        )
        .unwrap();
        assert_eq!(parsed.correlation_id, "c-1");
        assert_eq!(parsed.envelope.to_agent, "writer");
        assert_eq!(parsed.payload, msg.payload);
    }
}
