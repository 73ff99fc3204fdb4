//! Azure Service Bus client over the data-plane REST API.
//!
//! Publishes with `BrokerProperties` + custom property headers and consumes
//! via peek-lock (`POST …/messages/head`, then DELETE to complete or PUT to
//! abandon). Authentication is either a SAS token minted from the
//! connection string or an ambient managed-identity bearer token from IMDS;
//! one credential is created at start and reused for the client lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServiceBusSettings;
use crate::error::{ProxyError, ProxyResult};

use super::{
    run_supervised, BusClient, BusMessage, ConnectionStats, MessageHandler, MessageType,
    ReceivePass, StatsSnapshot, SubscriptionSpec,
};

type HmacSha256 = Hmac<Sha256>;

/// Seconds a cached token is considered valid short of its real expiry.
const TOKEN_REFRESH_BUFFER_SECS: i64 = 60;

/// Lifetime requested for minted SAS tokens.
const SAS_TOKEN_LIFETIME_SECS: i64 = 6 * 60 * 60;

/// Azure IMDS endpoint for managed-identity tokens.
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Custom property headers carried on every message for server-side
/// filtering.
const PROPERTY_HEADERS: &[&str] = &["messageType", "toAgent", "fromAgent", "fromProxy", "toProxy"];

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Pieces of a Service Bus connection string.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionStringParts {
    pub endpoint: String,
    pub key_name: String,
    pub key: String,
}

/// Parse `Endpoint=sb://…;SharedAccessKeyName=…;SharedAccessKey=…`.
pub(crate) fn parse_connection_string(raw: &str) -> ProxyResult<ConnectionStringParts> {
    let mut endpoint = None;
    let mut key_name = None;
    let mut key = None;
    for part in raw.split(';') {
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        match k.trim() {
            "Endpoint" => endpoint = Some(v.trim().to_string()),
            "SharedAccessKeyName" => key_name = Some(v.trim().to_string()),
            // The key itself may contain '=' padding; split_once keeps it.
            "SharedAccessKey" => key = Some(v.trim().to_string()),
            _ => {}
        }
    }
    let endpoint = endpoint
        .ok_or_else(|| ProxyError::Config("connection string missing Endpoint".to_string()))?
        .replace("sb://", "https://")
        .trim_end_matches('/')
        .to_string();
    Ok(ConnectionStringParts {
        endpoint,
        key_name: key_name.ok_or_else(|| {
            ProxyError::Config("connection string missing SharedAccessKeyName".to_string())
        })?,
        key: key.ok_or_else(|| {
            ProxyError::Config("connection string missing SharedAccessKey".to_string())
        })?,
    })
}

/// Mint a SAS token for a resource URI.
pub(crate) fn generate_sas_token(
    resource_uri: &str,
    key_name: &str,
    key: &str,
    expiry_unix: i64,
) -> ProxyResult<String> {
    let encoded_uri = urlencoding::encode(resource_uri);
    let string_to_sign = format!("{encoded_uri}\n{expiry_unix}");
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| ProxyError::internal_error(format!("invalid SAS key: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry_unix}&skn={key_name}",
        urlencoding::encode(&signature)
    ))
}

/// A single reusable credential: SAS from the connection string, or a
/// managed-identity bearer token from IMDS. Tokens are cached until close
/// to expiry.
pub(crate) enum BusCredential {
    Sas {
        parts: ConnectionStringParts,
        cached: Mutex<Option<(String, i64)>>,
    },
    ManagedIdentity {
        resource_endpoint: String,
        http: reqwest::Client,
        cached: Mutex<Option<(String, i64)>>,
    },
}

impl BusCredential {
    /// Build the credential from settings: connection string wins, ambient
    /// managed identity otherwise.
    pub(crate) fn from_settings(settings: &ServiceBusSettings) -> ProxyResult<Self> {
        match &settings.connection_string {
            Some(raw) => Ok(Self::Sas {
                parts: parse_connection_string(raw)?,
                cached: Mutex::new(None),
            }),
            None => Ok(Self::ManagedIdentity {
                resource_endpoint: format!("https://{}", settings.fully_qualified_namespace()),
                http: reqwest::Client::new(),
                cached: Mutex::new(None),
            }),
        }
    }

    /// Base HTTPS endpoint of the namespace.
    pub(crate) fn endpoint(&self) -> &str {
        match self {
            Self::Sas { parts, .. } => &parts.endpoint,
            Self::ManagedIdentity {
                resource_endpoint, ..
            } => resource_endpoint,
        }
    }

    /// Value for the `Authorization` header, from cache when fresh.
    pub(crate) async fn authorization(&self) -> ProxyResult<String> {
        let now = chrono::Utc::now().timestamp();
        match self {
            Self::Sas { parts, cached } => {
                let mut cache = cached.lock().await;
                if let Some((token, expiry)) = cache.as_ref() {
                    if now < expiry - TOKEN_REFRESH_BUFFER_SECS {
                        return Ok(token.clone());
                    }
                }
                let expiry = now + SAS_TOKEN_LIFETIME_SECS;
                let token =
                    generate_sas_token(&parts.endpoint, &parts.key_name, &parts.key, expiry)?;
                *cache = Some((token.clone(), expiry));
                Ok(token)
            }
            Self::ManagedIdentity {
                resource_endpoint: _,
                http,
                cached,
            } => {
                let mut cache = cached.lock().await;
                if let Some((token, expiry)) = cache.as_ref() {
                    if now < expiry - TOKEN_REFRESH_BUFFER_SECS {
                        return Ok(token.clone());
                    }
                }
                let resp = http
                    .get(IMDS_TOKEN_URL)
                    .query(&[
                        ("api-version", "2018-02-01"),
                        ("resource", "https://servicebus.azure.net"),
                    ])
                    .header("Metadata", "true")
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await
                    .map_err(|e| {
                        ProxyError::Transport(format!("managed identity token fetch failed: {e}"))
                    })?;
                let body: serde_json::Value = resp.json().await.map_err(|e| {
                    ProxyError::InvalidJson(format!("managed identity token response: {e}"))
                })?;
                let access_token = body
                    .get("access_token")
                    .and_then(|t| t.as_str())
                    .ok_or_else(|| {
                        ProxyError::Transport("managed identity response had no token".to_string())
                    })?;
                let expires_on = body
                    .get("expires_on")
                    .and_then(|e| e.as_str())
                    .and_then(|e| e.parse::<i64>().ok())
                    .unwrap_or(now + 3600);
                let token = format!("Bearer {access_token}");
                *cache = Some((token.clone(), expires_on));
                Ok(token)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct AzureBusCore {
    settings: ServiceBusSettings,
    credential: BusCredential,
    http: reqwest::Client,
    stats: Arc<ConnectionStats>,
    running: AtomicBool,
}

impl AzureBusCore {
    fn entity_url(&self, path: &str) -> String {
        format!("{}/{}", self.credential.endpoint(), path)
    }

    /// Send one pre-serialized message.
    async fn send_one(
        &self,
        topic_name: &str,
        message: &BusMessage,
        session_key: Option<&str>,
    ) -> ProxyResult<()> {
        let auth = self.credential.authorization().await?;
        let url = self.entity_url(&format!("{topic_name}/messages"));

        let mut broker_props = serde_json::Map::new();
        broker_props.insert(
            "MessageId".to_string(),
            serde_json::Value::String(message.message_id.clone()),
        );
        broker_props.insert(
            "CorrelationId".to_string(),
            serde_json::Value::String(message.correlation_id.clone()),
        );
        if let Some(session) = session_key {
            broker_props.insert(
                "SessionId".to_string(),
                serde_json::Value::String(session.to_string()),
            );
        }
        // Per-message TTL from the envelope; the broker enforces expiry.
        broker_props.insert(
            "TimeToLive".to_string(),
            serde_json::Value::from(message.envelope.ttl),
        );

        let mut req = self
            .http
            .post(&url)
            .header("Authorization", &auth)
            .header("Content-Type", "application/json")
            .header(
                "BrokerProperties",
                serde_json::to_string(&broker_props).unwrap_or_default(),
            );
        // Custom properties travel as individual quoted headers.
        for (key, value) in message.broker_properties() {
            req = req.header(key.as_str(), format!("\"{value}\""));
        }

        let resp = req.body(message.to_wire_body()?).send().await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProxyError::Http { status, body });
        }
        Ok(())
    }

    /// Send a batch as one broker call: all messages are accepted or none.
    async fn send_many(
        &self,
        topic_name: &str,
        messages: &[BusMessage],
        session_key: Option<&str>,
    ) -> ProxyResult<()> {
        let auth = self.credential.authorization().await?;
        let url = self.entity_url(&format!("{topic_name}/messages"));

        let mut entries = Vec::with_capacity(messages.len());
        for message in messages {
            let mut broker_props = serde_json::Map::new();
            broker_props.insert(
                "MessageId".to_string(),
                serde_json::Value::String(message.message_id.clone()),
            );
            broker_props.insert(
                "CorrelationId".to_string(),
                serde_json::Value::String(message.correlation_id.clone()),
            );
            if let Some(session) = session_key {
                broker_props.insert(
                    "SessionId".to_string(),
                    serde_json::Value::String(session.to_string()),
                );
            }
            broker_props.insert(
                "TimeToLive".to_string(),
                serde_json::Value::from(message.envelope.ttl),
            );
            entries.push(serde_json::json!({
                "Body": message.to_wire_body()?,
                "BrokerProperties": broker_props,
                "UserProperties": message.broker_properties(),
            }));
        }

        let resp = self
            .http
            .post(&url)
            .header("Authorization", &auth)
            .header("Content-Type", "application/vnd.microsoft.servicebus.json")
            .body(serde_json::to_string(&entries)?)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProxyError::Http { status, body });
        }
        Ok(())
    }

    /// One peek-lock receive pass: long-poll, dispatch, settle, repeat
    /// until idle, shutdown, or transport failure.
    async fn receive_pass(
        &self,
        spec: &SubscriptionSpec,
        handler: &MessageHandler,
    ) -> ProxyResult<ReceivePass> {
        loop {
            if !self.running.load(Ordering::Relaxed) {
                return Ok(ReceivePass::Stopped);
            }

            let auth = self.credential.authorization().await?;
            let url = self.entity_url(&format!(
                "{}/subscriptions/{}/messages/head",
                spec.topic_name, spec.name
            ));
            let resp = self
                .http
                .post(&url)
                .query(&[("timeout", self.settings.receive_timeout)])
                .header("Authorization", &auth)
                .send()
                .await?;

            match resp.status().as_u16() {
                // Long poll expired with nothing to deliver.
                204 => return Ok(ReceivePass::Idle),
                s if s < 300 => {
                    let delivery = self.parse_delivery(resp).await?;
                    self.settle(spec, delivery, handler).await;
                }
                s => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(ProxyError::Http { status: s, body });
                }
            }
        }
    }

    /// Decode a peek-locked delivery.
    async fn parse_delivery(&self, resp: reqwest::Response) -> ProxyResult<LockedDelivery> {
        let broker_props: serde_json::Value = resp
            .headers()
            .get("BrokerProperties")
            .and_then(|h| h.to_str().ok())
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        let message_id = broker_props
            .get("MessageId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let lock_token = broker_props
            .get("LockToken")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let delivery_count = broker_props
            .get("DeliveryCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;

        let mut properties = HashMap::new();
        for name in PROPERTY_HEADERS {
            if let Some(value) = resp.headers().get(*name).and_then(|h| h.to_str().ok()) {
                properties.insert(name.to_string(), value.trim_matches('"').to_string());
            }
        }

        let body = resp.text().await?;
        Ok(LockedDelivery {
            message_id,
            lock_token,
            delivery_count,
            properties,
            body,
        })
    }

    /// Run the handler, then complete or abandon the broker delivery.
    async fn settle(
        &self,
        spec: &SubscriptionSpec,
        delivery: LockedDelivery,
        handler: &MessageHandler,
    ) {
        let message_type = delivery
            .properties
            .get("messageType")
            .map(|s| MessageType::parse(s))
            .unwrap_or(MessageType::Request);

        let converted = BusMessage::from_wire_body(
            delivery.message_id.clone(),
            message_type,
            &delivery.body,
            delivery.properties.clone(),
        )
        .map(|mut msg| {
            msg.retry_count = delivery.delivery_count;
            msg
        });

        let handled = match converted {
            Ok(message) => handler(message).await,
            Err(e) => Err(e),
        };

        match handled {
            Ok(()) => {
                if let Err(e) = self
                    .settle_request(reqwest::Method::DELETE, spec, &delivery)
                    .await
                {
                    warn!(
                        subscription = %spec.name,
                        message_id = %delivery.message_id,
                        error = %e,
                        "Failed to complete message"
                    );
                }
                self.stats.record_received();
            }
            Err(e) => {
                error!(
                    subscription = %spec.name,
                    message_id = %delivery.message_id,
                    error = %e,
                    "Handler failed, abandoning message"
                );
                if let Err(abandon_err) = self
                    .settle_request(reqwest::Method::PUT, spec, &delivery)
                    .await
                {
                    warn!(
                        subscription = %spec.name,
                        message_id = %delivery.message_id,
                        error = %abandon_err,
                        "Failed to abandon message"
                    );
                }
                self.stats.record_failed();
            }
        }
    }

    async fn settle_request(
        &self,
        method: reqwest::Method,
        spec: &SubscriptionSpec,
        delivery: &LockedDelivery,
    ) -> ProxyResult<()> {
        let auth = self.credential.authorization().await?;
        let url = self.entity_url(&format!(
            "{}/subscriptions/{}/messages/{}/{}",
            spec.topic_name, spec.name, delivery.message_id, delivery.lock_token
        ));
        let resp = self
            .http
            .request(method, &url)
            .header("Authorization", &auth)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProxyError::Http { status, body });
        }
        Ok(())
    }
}

struct LockedDelivery {
    message_id: String,
    lock_token: String,
    delivery_count: u32,
    properties: HashMap<String, String>,
    body: String,
}

/// Azure Service Bus implementation of [`BusClient`].
pub struct AzureBusClient {
    core: Arc<AzureBusCore>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl AzureBusClient {
    /// Create a client for the configured namespace. The credential is
    /// created once here and reused for the lifetime of the client.
    pub fn new(settings: ServiceBusSettings) -> ProxyResult<Self> {
        let credential = BusCredential::from_settings(&settings)?;
        let http = reqwest::Client::builder()
            // Receive long-polls hold the connection open for up to
            // `receive_timeout`; leave generous headroom.
            .timeout(Duration::from_secs(settings.receive_timeout + 30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Ok(Self {
            core: Arc::new(AzureBusCore {
                settings,
                credential,
                http,
                stats: Arc::new(ConnectionStats::default()),
                running: AtomicBool::new(false),
            }),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait::async_trait]
impl BusClient for AzureBusClient {
    async fn start(&self) -> ProxyResult<()> {
        if self.core.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core.stats.record_connect_attempt();
        // Acquiring the first token proves the credential works.
        self.core.credential.authorization().await.map_err(|e| {
            self.core.running.store(false, Ordering::SeqCst);
            e
        })?;
        self.core.stats.record_connected();
        info!(
            namespace = %self.core.settings.namespace,
            auth = if self.core.settings.connection_string.is_some() {
                "connection string"
            } else {
                "managed identity"
            },
            "Connected to Service Bus"
        );
        Ok(())
    }

    async fn stop(&self) {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut subscriptions = self.subscriptions.lock().await;
        for (name, handle) in subscriptions.drain() {
            handle.abort();
            debug!(subscription = %name, "Receive loop aborted");
            self.core.stats.adjust_subscriptions(-1);
        }
        self.core.stats.record_disconnected();
        info!("Service Bus client stopped");
    }

    async fn send_message(
        &self,
        topic_name: &str,
        message: BusMessage,
        session_key: Option<&str>,
    ) -> bool {
        if !self.core.running.load(Ordering::Relaxed) {
            warn!(topic = %topic_name, "Send rejected: client not running");
            return false;
        }
        match self.core.send_one(topic_name, &message, session_key).await {
            Ok(()) => {
                self.core.stats.record_sent();
                debug!(topic = %topic_name, message_id = %message.message_id, "Message sent");
                true
            }
            Err(e) => {
                self.core.stats.record_failed();
                error!(topic = %topic_name, error = %e, "Failed to send message");
                false
            }
        }
    }

    async fn send_batch(
        &self,
        topic_name: &str,
        messages: Vec<BusMessage>,
        session_key: Option<&str>,
    ) -> usize {
        if messages.is_empty() {
            return 0;
        }
        if !self.core.running.load(Ordering::Relaxed) {
            warn!(topic = %topic_name, "Batch rejected: client not running");
            return 0;
        }
        let count = messages.len();
        match self.core.send_many(topic_name, &messages, session_key).await {
            Ok(()) => {
                for _ in 0..count {
                    self.core.stats.record_sent();
                }
                debug!(topic = %topic_name, count, "Batch sent");
                count
            }
            Err(e) => {
                for _ in 0..count {
                    self.core.stats.record_failed();
                }
                error!(topic = %topic_name, count, error = %e, "Failed to send batch");
                0
            }
        }
    }

    async fn create_subscription(&self, spec: SubscriptionSpec, handler: MessageHandler) -> bool {
        if !self.core.running.load(Ordering::Relaxed) {
            warn!(subscription = %spec.name, "Subscription rejected: client not running");
            return false;
        }
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&spec.name) {
            debug!(subscription = %spec.name, "Subscription already active");
            return true;
        }

        let core = Arc::clone(&self.core);
        let name = spec.name.clone();
        let stats = Arc::clone(&self.core.stats);
        let task = tokio::spawn(async move {
            let loop_spec = spec;
            run_supervised(loop_spec.name.clone(), stats, || {
                let core = Arc::clone(&core);
                let spec = loop_spec.clone();
                let handler = Arc::clone(&handler);
                async move { core.receive_pass(&spec, &handler).await }
            })
            .await;
        });
        subscriptions.insert(name.clone(), task);
        self.core.stats.adjust_subscriptions(1);
        info!(subscription = %name, "Subscription receive loop started");
        true
    }

    async fn delete_subscription(&self, subscription_name: &str, _topic_name: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock().await;
        match subscriptions.remove(subscription_name) {
            Some(handle) => {
                handle.abort();
                self.core.stats.adjust_subscriptions(-1);
                info!(subscription = %subscription_name, "Subscription deleted");
                true
            }
            None => {
                warn!(subscription = %subscription_name, "Subscription not found");
                false
            }
        }
    }

    fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }
}
