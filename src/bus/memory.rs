//! In-process broker implementing the same contract as the Azure client.
//!
//! Topics hold filtered subscriptions, each backed by a single ordered
//! channel (so session-keyed FIFO holds trivially), with delivery counting
//! and per-subscription dead-lettering. Used by the test suite and by
//! local development without a bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ProxyResult;

use super::admin::{AdminError, AdminResult, BusAdmin, TopicProperties};
use super::{
    filter_matches, run_supervised, BusClient, BusMessage, ConnectionStats, MessageHandler,
    ReceivePass, StatsSnapshot, SubscriptionSpec,
};

struct Delivery {
    message: BusMessage,
    delivery_count: u32,
}

struct SubscriptionState {
    spec: SubscriptionSpec,
    tx: mpsc::UnboundedSender<Delivery>,
    /// Taken by the consumer task when the client attaches.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

struct TopicState {
    properties: TopicProperties,
    subscriptions: HashMap<String, Arc<SubscriptionState>>,
}

struct BusState {
    topics: RwLock<HashMap<String, TopicState>>,
    dead_letters: RwLock<HashMap<String, Vec<BusMessage>>>,
    stats: Arc<ConnectionStats>,
    running: AtomicBool,
}

impl BusState {
    fn dlq_key(topic: &str, subscription: &str) -> String {
        format!("{topic}/{subscription}")
    }
}

/// In-memory implementation of [`BusClient`].
pub struct InMemoryBus {
    state: Arc<BusState>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl InMemoryBus {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(BusState {
                topics: RwLock::new(HashMap::new()),
                dead_letters: RwLock::new(HashMap::new()),
                stats: Arc::new(ConnectionStats::default()),
                running: AtomicBool::new(false),
            }),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Management facade over this broker's namespace.
    pub fn admin(&self) -> InMemoryBusAdmin {
        InMemoryBusAdmin {
            state: Arc::clone(&self.state),
        }
    }

    /// Messages dead-lettered off a subscription (test observability).
    pub async fn dead_letters(&self, topic_name: &str, subscription_name: &str) -> Vec<BusMessage> {
        self.state
            .dead_letters
            .read()
            .await
            .get(&BusState::dlq_key(topic_name, subscription_name))
            .cloned()
            .unwrap_or_default()
    }

    /// Register a subscription entry, creating its topic with default
    /// properties when the namespace has not been reconciled yet.
    async fn ensure_subscription(&self, spec: &SubscriptionSpec) -> Arc<SubscriptionState> {
        let mut topics = self.state.topics.write().await;
        let topic = topics
            .entry(spec.topic_name.clone())
            .or_insert_with(|| TopicState {
                properties: default_topic_properties(),
                subscriptions: HashMap::new(),
            });
        Arc::clone(topic.subscriptions.entry(spec.name.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(SubscriptionState {
                spec: spec.clone(),
                tx,
                rx: Mutex::new(Some(rx)),
            })
        }))
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

fn default_topic_properties() -> TopicProperties {
    TopicProperties {
        default_message_ttl_secs: 3600,
        max_size_in_megabytes: 1024,
        requires_duplicate_detection: true,
        duplicate_detection_window_minutes: 10,
        enable_partitioning: false,
        support_ordering: true,
        enable_express: false,
    }
}

#[async_trait]
impl BusClient for InMemoryBus {
    async fn start(&self) -> ProxyResult<()> {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.stats.record_connect_attempt();
        self.state.stats.record_connected();
        info!("In-memory bus started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        for (name, handle) in tasks.drain() {
            handle.abort();
            debug!(subscription = %name, "Receive loop aborted");
            self.state.stats.adjust_subscriptions(-1);
        }
        self.state.stats.record_disconnected();
        info!("In-memory bus stopped");
    }

    async fn send_message(
        &self,
        topic_name: &str,
        message: BusMessage,
        _session_key: Option<&str>,
    ) -> bool {
        if !self.state.running.load(Ordering::Relaxed) {
            warn!(topic = %topic_name, "Send rejected: bus not running");
            return false;
        }
        let topics = self.state.topics.read().await;
        let Some(topic) = topics.get(topic_name) else {
            self.state.stats.record_failed();
            warn!(topic = %topic_name, "Send failed: topic does not exist");
            return false;
        };

        let properties = message.broker_properties();
        let mut delivered = 0;
        for subscription in topic.subscriptions.values() {
            let matches = subscription
                .spec
                .filter_rule
                .as_deref()
                .map(|rule| filter_matches(rule, &properties))
                .unwrap_or(true);
            if !matches {
                continue;
            }
            if subscription
                .tx
                .send(Delivery {
                    message: message.clone(),
                    delivery_count: 1,
                })
                .is_ok()
            {
                delivered += 1;
            }
        }
        self.state.stats.record_sent();
        debug!(
            topic = %topic_name,
            message_id = %message.message_id,
            subscriptions = delivered,
            "Message published"
        );
        true
    }

    async fn send_batch(
        &self,
        topic_name: &str,
        messages: Vec<BusMessage>,
        session_key: Option<&str>,
    ) -> usize {
        let mut sent = 0;
        for message in messages {
            if self.send_message(topic_name, message, session_key).await {
                sent += 1;
            }
        }
        sent
    }

    async fn create_subscription(&self, spec: SubscriptionSpec, handler: MessageHandler) -> bool {
        if !self.state.running.load(Ordering::Relaxed) {
            warn!(subscription = %spec.name, "Subscription rejected: bus not running");
            return false;
        }
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&spec.name) {
            debug!(subscription = %spec.name, "Subscription already active");
            return true;
        }

        let subscription = self.ensure_subscription(&spec).await;
        let Some(rx) = subscription.rx.lock().await.take() else {
            debug!(subscription = %spec.name, "Receiver already attached");
            return true;
        };
        let rx = Arc::new(Mutex::new(rx));

        let state = Arc::clone(&self.state);
        let stats = Arc::clone(&self.state.stats);
        let name = spec.name.clone();
        let task = tokio::spawn(async move {
            let loop_spec = spec;
            run_supervised(loop_spec.name.clone(), stats, || {
                let state = Arc::clone(&state);
                let rx = Arc::clone(&rx);
                let spec = loop_spec.clone();
                let handler = Arc::clone(&handler);
                async move { receive_pass(state, rx, spec, handler).await }
            })
            .await;
        });
        tasks.insert(name.clone(), task);
        self.state.stats.adjust_subscriptions(1);
        info!(subscription = %name, "Subscription receive loop started");
        true
    }

    async fn delete_subscription(&self, subscription_name: &str, topic_name: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        let removed_task = match tasks.remove(subscription_name) {
            Some(handle) => {
                handle.abort();
                self.state.stats.adjust_subscriptions(-1);
                true
            }
            None => false,
        };
        let mut topics = self.state.topics.write().await;
        let removed_entry = topics
            .get_mut(topic_name)
            .map(|t| t.subscriptions.remove(subscription_name).is_some())
            .unwrap_or(false);
        if removed_task || removed_entry {
            info!(subscription = %subscription_name, "Subscription deleted");
        }
        removed_task || removed_entry
    }

    fn stats(&self) -> StatsSnapshot {
        self.state.stats.snapshot()
    }
}

/// One receive pass over the subscription channel: process deliveries one
/// at a time, abandoning (re-enqueue with an incremented delivery count)
/// on handler failure and dead-lettering once the delivery budget is
/// spent.
async fn receive_pass(
    state: Arc<BusState>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    spec: SubscriptionSpec,
    handler: MessageHandler,
) -> ProxyResult<ReceivePass> {
    let mut rx = rx.lock().await;
    loop {
        if !state.running.load(Ordering::Relaxed) {
            return Ok(ReceivePass::Stopped);
        }
        let delivery = match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Some(delivery)) => delivery,
            // Channel closed: the subscription was deleted.
            Ok(None) => return Ok(ReceivePass::Stopped),
            // No traffic; poll the shutdown flag again.
            Err(_) => continue,
        };

        let mut message = delivery.message;
        message.retry_count = delivery.delivery_count;

        // Expired messages are never delivered; the broker dead-letters
        // them when the subscription opted in.
        if message.is_expired() {
            debug!(
                subscription = %spec.name,
                message_id = %message.message_id,
                "Message expired before delivery"
            );
            if spec.dead_lettering_on_message_expiration {
                state
                    .dead_letters
                    .write()
                    .await
                    .entry(BusState::dlq_key(&spec.topic_name, &spec.name))
                    .or_default()
                    .push(message);
            }
            continue;
        }

        match handler(message.clone()).await {
            Ok(()) => state.stats.record_received(),
            Err(e) => {
                state.stats.record_failed();
                if delivery.delivery_count >= spec.max_delivery_count {
                    warn!(
                        subscription = %spec.name,
                        message_id = %message.message_id,
                        deliveries = delivery.delivery_count,
                        error = %e,
                        "Delivery budget exhausted, dead-lettering"
                    );
                    state
                        .dead_letters
                        .write()
                        .await
                        .entry(BusState::dlq_key(&spec.topic_name, &spec.name))
                        .or_default()
                        .push(message);
                } else {
                    debug!(
                        subscription = %spec.name,
                        message_id = %message.message_id,
                        attempt = delivery.delivery_count,
                        error = %e,
                        "Handler failed, abandoning for redelivery"
                    );
                    let topics = state.topics.read().await;
                    if let Some(sub) = topics
                        .get(&spec.topic_name)
                        .and_then(|t| t.subscriptions.get(&spec.name))
                    {
                        let _ = sub.tx.send(Delivery {
                            message,
                            delivery_count: delivery.delivery_count + 1,
                        });
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Admin facade
// ---------------------------------------------------------------------------

/// [`BusAdmin`] implementation over the in-memory broker's namespace.
pub struct InMemoryBusAdmin {
    state: Arc<BusState>,
}

#[async_trait]
impl BusAdmin for InMemoryBusAdmin {
    async fn get_topic(&self, topic_name: &str) -> AdminResult<TopicProperties> {
        self.state
            .topics
            .read()
            .await
            .get(topic_name)
            .map(|t| t.properties.clone())
            .ok_or(AdminError::NotFound)
    }

    async fn create_topic(&self, topic_name: &str, props: &TopicProperties) -> AdminResult<()> {
        let mut topics = self.state.topics.write().await;
        if topics.contains_key(topic_name) {
            return Err(AdminError::AlreadyExists);
        }
        topics.insert(
            topic_name.to_string(),
            TopicState {
                properties: props.clone(),
                subscriptions: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn update_topic(&self, topic_name: &str, props: &TopicProperties) -> AdminResult<()> {
        let mut topics = self.state.topics.write().await;
        match topics.get_mut(topic_name) {
            Some(topic) => {
                topic.properties = props.clone();
                Ok(())
            }
            None => Err(AdminError::NotFound),
        }
    }

    async fn delete_topic(&self, topic_name: &str) -> AdminResult<()> {
        let mut topics = self.state.topics.write().await;
        match topics.remove(topic_name) {
            Some(_) => Ok(()),
            None => Err(AdminError::NotFound),
        }
    }

    async fn list_topics(&self) -> AdminResult<Vec<String>> {
        let mut names: Vec<String> = self.state.topics.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_subscription(
        &self,
        topic_name: &str,
        spec: &SubscriptionSpec,
    ) -> AdminResult<()> {
        let mut topics = self.state.topics.write().await;
        let topic = topics.get_mut(topic_name).ok_or(AdminError::NotFound)?;
        topic
            .subscriptions
            .entry(spec.name.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                Arc::new(SubscriptionState {
                    spec: spec.clone(),
                    tx,
                    rx: Mutex::new(Some(rx)),
                })
            });
        Ok(())
    }

    async fn delete_subscription(
        &self,
        topic_name: &str,
        subscription_name: &str,
    ) -> AdminResult<()> {
        let mut topics = self.state.topics.write().await;
        let topic = topics.get_mut(topic_name).ok_or(AdminError::NotFound)?;
        match topic.subscriptions.remove(subscription_name) {
            Some(_) => Ok(()),
            None => Err(AdminError::NotFound),
        }
    }
}
