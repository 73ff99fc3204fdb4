//! Typed publisher — envelopes onto group-sharded topics.
//!
//! The session key defaults to the correlation id, which serializes a
//! request/response pair (and any chunked stream of one conversation)
//! through a single broker session, preserving order.
//!
//! The group is always supplied by the caller from an agent-registry
//! lookup; the wire envelope carries no group field.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::types::{request_topic, response_topic, MessageEnvelope, NOTIFICATION_TOPIC};

use super::{BusClient, BusMessage, MessageType};

/// Publishes typed messages through a [`BusClient`].
pub struct MessagePublisher {
    client: Arc<dyn BusClient>,
}

impl MessagePublisher {
    /// Create a publisher over the given bus client.
    pub fn new(client: Arc<dyn BusClient>) -> Self {
        Self { client }
    }

    /// Publish a request onto `a2a.{group}.requests`.
    ///
    /// Session key is `session_id` when given, else the envelope's
    /// correlation id.
    pub async fn publish_request(
        &self,
        envelope: MessageEnvelope,
        payload: Vec<u8>,
        group: &str,
        session_id: Option<&str>,
    ) -> bool {
        let correlation_id = envelope.correlation_id.clone();
        let to_agent = envelope.to_agent.clone();
        debug!(
            to_agent = %to_agent,
            correlation_id = %correlation_id,
            "Publishing request"
        );

        let topic = request_topic(group);
        let message = BusMessage::new(MessageType::Request, envelope, payload);
        let session_key = session_id.unwrap_or(&correlation_id);

        let sent = self
            .client
            .send_message(&topic, message, Some(session_key))
            .await;
        if sent {
            info!(
                to_agent = %to_agent,
                topic = %topic,
                correlation_id = %correlation_id,
                "Request published"
            );
        } else {
            error!(
                to_agent = %to_agent,
                correlation_id = %correlation_id,
                "Failed to publish request"
            );
        }
        sent
    }

    /// Publish a response onto `a2a.{group}.responses`.
    pub async fn publish_response(
        &self,
        envelope: MessageEnvelope,
        payload: Vec<u8>,
        group: &str,
        correlation_id: &str,
        session_id: Option<&str>,
    ) -> bool {
        debug!(correlation_id = %correlation_id, "Publishing response");

        let topic = response_topic(group);
        let message = BusMessage::new(MessageType::Response, envelope, payload);
        let session_key = session_id.unwrap_or(correlation_id);

        let sent = self
            .client
            .send_message(&topic, message, Some(session_key))
            .await;
        if sent {
            info!(
                topic = %topic,
                correlation_id = %correlation_id,
                "Response published"
            );
        } else {
            error!(correlation_id = %correlation_id, "Failed to publish response");
        }
        sent
    }

    /// Publish a notification onto the shared `a2a-notifications` topic.
    pub async fn publish_notification(
        &self,
        envelope: MessageEnvelope,
        payload: Vec<u8>,
    ) -> bool {
        let correlation_id = envelope.correlation_id.clone();
        debug!(correlation_id = %correlation_id, "Publishing notification");

        let message = BusMessage::new(MessageType::Notification, envelope, payload);
        let sent = self
            .client
            .send_message(NOTIFICATION_TOPIC, message, Some(&correlation_id))
            .await;
        if sent {
            info!(correlation_id = %correlation_id, "Notification published");
        } else {
            error!(correlation_id = %correlation_id, "Failed to publish notification");
        }
        sent
    }
}
