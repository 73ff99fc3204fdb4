//! Bus administration — topic and subscription management.
//!
//! The topic lifecycle manager talks to the broker's management surface
//! through [`BusAdmin`]. The Azure implementation speaks the management
//! REST API (ATOM entries over HTTPS); tests use the in-memory admin.

use std::collections::HashMap;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, info};

use crate::config::{ServiceBusSettings, TopicGroupConfig};
use crate::error::ProxyResult;

use super::azure::BusCredential;
use super::SubscriptionSpec;

/// Failure modes of administrative operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdminError {
    /// The entity does not exist.
    #[error("entity not found")]
    NotFound,
    /// The entity already exists (benign on create races).
    #[error("entity already exists")]
    AlreadyExists,
    /// Anything else: auth failures, transport faults, malformed payloads.
    #[error("{0}")]
    Failed(String),
}

/// Result alias for admin operations.
pub type AdminResult<T> = Result<T, AdminError>;

/// Broker-side properties of a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicProperties {
    /// Message TTL, seconds.
    pub default_message_ttl_secs: i64,
    /// Maximum topic size in megabytes.
    pub max_size_in_megabytes: u32,
    /// Whether duplicate detection is on.
    pub requires_duplicate_detection: bool,
    /// Duplicate-detection history window, minutes.
    pub duplicate_detection_window_minutes: u32,
    /// Whether the topic is partitioned.
    pub enable_partitioning: bool,
    /// FIFO support for session-keyed delivery.
    pub support_ordering: bool,
    /// Express topics buffer in memory and cannot order; always off here.
    pub enable_express: bool,
}

impl TopicProperties {
    /// Derive topic properties from a group's configuration.
    ///
    /// Ordering and duplicate detection are always on (session-keyed FIFO
    /// depends on them); express mode is always off.
    pub fn from_group(config: &TopicGroupConfig) -> Self {
        Self {
            default_message_ttl_secs: config.message_ttl_seconds,
            max_size_in_megabytes: config.max_message_size_mb * 1024,
            requires_duplicate_detection: true,
            duplicate_detection_window_minutes: config.duplicate_detection_window_minutes,
            enable_partitioning: config.enable_partitioning,
            support_ordering: true,
            enable_express: false,
        }
    }

    /// Whether the live topic differs on the reconciled fields.
    pub fn differs_from(&self, other: &TopicProperties) -> bool {
        self.max_size_in_megabytes != other.max_size_in_megabytes
            || self.default_message_ttl_secs != other.default_message_ttl_secs
            || self.duplicate_detection_window_minutes != other.duplicate_detection_window_minutes
    }
}

/// Abstract management surface of the broker.
#[async_trait]
pub trait BusAdmin: Send + Sync {
    /// Fetch a topic's properties. `NotFound` if absent.
    async fn get_topic(&self, topic_name: &str) -> AdminResult<TopicProperties>;

    /// Create a topic. `AlreadyExists` on a create race.
    async fn create_topic(&self, topic_name: &str, props: &TopicProperties) -> AdminResult<()>;

    /// Update a topic's properties in place.
    async fn update_topic(&self, topic_name: &str, props: &TopicProperties) -> AdminResult<()>;

    /// Delete a topic. `NotFound` if absent.
    async fn delete_topic(&self, topic_name: &str) -> AdminResult<()>;

    /// All topic names in the namespace.
    async fn list_topics(&self) -> AdminResult<Vec<String>>;

    /// Create a durable subscription, installing its filter rule in place
    /// of the default accept-all rule. Idempotent.
    async fn create_subscription(&self, topic_name: &str, spec: &SubscriptionSpec)
        -> AdminResult<()>;

    /// Delete a subscription. `NotFound` if absent.
    async fn delete_subscription(&self, topic_name: &str, subscription_name: &str)
        -> AdminResult<()>;
}

// ---------------------------------------------------------------------------
// ISO-8601 durations
// ---------------------------------------------------------------------------

/// Encode seconds as an ISO-8601 duration (`PT3600S`).
pub(crate) fn encode_duration_secs(secs: i64) -> String {
    format!("PT{secs}S")
}

/// Decode the durations Azure emits (`PT1H`, `PT10M`, `P14DT6H30M5S`, …)
/// into whole seconds. Fractional seconds are truncated.
pub(crate) fn decode_duration_secs(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let rest = raw.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut total: i64 = 0;
    let mut number = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else {
            let value: i64 = number.parse().ok()?;
            number.clear();
            total += match c {
                'Y' => value * 365 * 86_400,
                'M' => value * 30 * 86_400,
                'W' => value * 7 * 86_400,
                'D' => value * 86_400,
                _ => return None,
            };
        }
    }
    for c in time_part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else {
            let value: f64 = number.parse().ok()?;
            number.clear();
            total += match c {
                'H' => (value * 3600.0) as i64,
                'M' => (value * 60.0) as i64,
                'S' => value as i64,
                _ => return None,
            };
        }
    }
    Some(total)
}

// ---------------------------------------------------------------------------
// Azure management-plane implementation
// ---------------------------------------------------------------------------

const API_VERSION: &str = "2017-04";

/// Azure Service Bus management client (ATOM over HTTPS).
pub struct AzureBusAdmin {
    credential: BusCredential,
    http: reqwest::Client,
}

impl AzureBusAdmin {
    /// Create an admin client; the credential is created once and reused.
    pub fn new(settings: &ServiceBusSettings) -> ProxyResult<Self> {
        Ok(Self {
            credential: BusCredential::from_settings(settings)?,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}?api-version={API_VERSION}",
            self.credential.endpoint(),
            path
        )
    }

    async fn auth(&self) -> AdminResult<String> {
        self.credential
            .authorization()
            .await
            .map_err(|e| AdminError::Failed(e.to_string()))
    }

    async fn put_entity(
        &self,
        path: &str,
        xml_body: String,
        if_match: bool,
    ) -> AdminResult<()> {
        let auth = self.auth().await?;
        let mut req = self
            .http
            .put(self.url(path))
            .header("Authorization", auth)
            .header("Content-Type", "application/atom+xml;type=entry;charset=utf-8");
        if if_match {
            req = req.header("If-Match", "*");
        }
        let resp = req
            .body(xml_body)
            .send()
            .await
            .map_err(|e| AdminError::Failed(e.to_string()))?;
        match resp.status().as_u16() {
            s if s < 300 => Ok(()),
            404 => Err(AdminError::NotFound),
            409 => Err(AdminError::AlreadyExists),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(AdminError::Failed(format!("HTTP {s}: {body}")))
            }
        }
    }

    fn topic_description_xml(props: &TopicProperties) -> String {
        format!(
            concat!(
                "<entry xmlns=\"http://www.w3.org/2005/Atom\">",
                "<content type=\"application/xml\">",
                "<TopicDescription xmlns=\"http://schemas.microsoft.com/netservices/2010/10/servicebus/connect\" ",
                "xmlns:i=\"http://www.w3.org/2001/XMLSchema-instance\">",
                "<DefaultMessageTimeToLive>{ttl}</DefaultMessageTimeToLive>",
                "<MaxSizeInMegabytes>{max_size}</MaxSizeInMegabytes>",
                "<RequiresDuplicateDetection>{dup}</RequiresDuplicateDetection>",
                "<DuplicateDetectionHistoryTimeWindow>{dup_window}</DuplicateDetectionHistoryTimeWindow>",
                "<EnableBatchedOperations>true</EnableBatchedOperations>",
                "<SupportOrdering>{ordering}</SupportOrdering>",
                "<EnablePartitioning>{partitioning}</EnablePartitioning>",
                "<EnableExpress>{express}</EnableExpress>",
                "</TopicDescription></content></entry>"
            ),
            ttl = encode_duration_secs(props.default_message_ttl_secs),
            max_size = props.max_size_in_megabytes,
            dup = props.requires_duplicate_detection,
            dup_window = encode_duration_secs(i64::from(props.duplicate_detection_window_minutes) * 60),
            ordering = props.support_ordering,
            partitioning = props.enable_partitioning,
            express = props.enable_express,
        )
    }

    fn subscription_description_xml(spec: &SubscriptionSpec) -> String {
        format!(
            concat!(
                "<entry xmlns=\"http://www.w3.org/2005/Atom\">",
                "<content type=\"application/xml\">",
                "<SubscriptionDescription xmlns=\"http://schemas.microsoft.com/netservices/2010/10/servicebus/connect\" ",
                "xmlns:i=\"http://www.w3.org/2001/XMLSchema-instance\">",
                "<LockDuration>{lock}</LockDuration>",
                "<RequiresSession>false</RequiresSession>",
                "<DefaultMessageTimeToLive>{ttl}</DefaultMessageTimeToLive>",
                "<DeadLetteringOnMessageExpiration>{dlq_expiry}</DeadLetteringOnMessageExpiration>",
                "<DeadLetteringOnFilterEvaluationExceptions>true</DeadLetteringOnFilterEvaluationExceptions>",
                "<MaxDeliveryCount>{max_delivery}</MaxDeliveryCount>",
                "<EnableBatchedOperations>true</EnableBatchedOperations>",
                "</SubscriptionDescription></content></entry>"
            ),
            lock = encode_duration_secs(spec.lock_duration_secs as i64),
            ttl = encode_duration_secs(spec.default_message_ttl_secs),
            dlq_expiry = spec.dead_lettering_on_message_expiration,
            max_delivery = spec.max_delivery_count,
        )
    }

    fn sql_rule_xml(filter: &str) -> String {
        format!(
            concat!(
                "<entry xmlns=\"http://www.w3.org/2005/Atom\">",
                "<content type=\"application/xml\">",
                "<RuleDescription xmlns=\"http://schemas.microsoft.com/netservices/2010/10/servicebus/connect\" ",
                "xmlns:i=\"http://www.w3.org/2001/XMLSchema-instance\">",
                "<Filter i:type=\"SqlFilter\"><SqlExpression>{expr}</SqlExpression></Filter>",
                "</RuleDescription></content></entry>"
            ),
            expr = xml_escape(filter),
        )
    }
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Pull the text content of the named elements out of an ATOM document.
fn extract_elements(xml: &str, names: &[&str]) -> HashMap<String, String> {
    let mut reader = Reader::from_str(xml);
    let mut found = HashMap::new();
    let mut current: Option<String> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if names.contains(&name.as_str()) {
                    current = Some(name);
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(name) = current.take() {
                    if let Ok(text) = t.unescape() {
                        found.insert(name, text.trim().to_string());
                    }
                }
            }
            Ok(Event::End(_)) => {
                current = None;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    found
}

/// Collect the `<title>` of every `<entry>` in an ATOM feed.
fn extract_entry_titles(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    let mut titles = Vec::new();
    let mut depth_in_entry = 0usize;
    let mut in_title = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"entry" => depth_in_entry += 1,
                b"title" if depth_in_entry > 0 => in_title = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"entry" => depth_in_entry = depth_in_entry.saturating_sub(1),
                b"title" => in_title = false,
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if in_title {
                    if let Ok(text) = t.unescape() {
                        let text = text.trim();
                        if !text.is_empty() {
                            titles.push(text.to_string());
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    titles
}

#[async_trait]
impl BusAdmin for AzureBusAdmin {
    async fn get_topic(&self, topic_name: &str) -> AdminResult<TopicProperties> {
        let auth = self.auth().await?;
        let resp = self
            .http
            .get(self.url(topic_name))
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| AdminError::Failed(e.to_string()))?;
        match resp.status().as_u16() {
            404 => return Err(AdminError::NotFound),
            s if s >= 300 => {
                let body = resp.text().await.unwrap_or_default();
                return Err(AdminError::Failed(format!("HTTP {s}: {body}")));
            }
            _ => {}
        }
        let xml = resp
            .text()
            .await
            .map_err(|e| AdminError::Failed(e.to_string()))?;
        // An existence GET on a missing topic can also come back as an
        // empty feed rather than a 404.
        if !xml.contains("TopicDescription") {
            return Err(AdminError::NotFound);
        }
        let fields = extract_elements(
            &xml,
            &[
                "DefaultMessageTimeToLive",
                "MaxSizeInMegabytes",
                "RequiresDuplicateDetection",
                "DuplicateDetectionHistoryTimeWindow",
                "EnablePartitioning",
                "SupportOrdering",
                "EnableExpress",
            ],
        );
        Ok(TopicProperties {
            default_message_ttl_secs: fields
                .get("DefaultMessageTimeToLive")
                .and_then(|v| decode_duration_secs(v))
                .unwrap_or(3600),
            max_size_in_megabytes: fields
                .get("MaxSizeInMegabytes")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1024),
            requires_duplicate_detection: fields
                .get("RequiresDuplicateDetection")
                .map(|v| v == "true")
                .unwrap_or(false),
            duplicate_detection_window_minutes: fields
                .get("DuplicateDetectionHistoryTimeWindow")
                .and_then(|v| decode_duration_secs(v))
                .map(|secs| (secs / 60) as u32)
                .unwrap_or(10),
            enable_partitioning: fields
                .get("EnablePartitioning")
                .map(|v| v == "true")
                .unwrap_or(false),
            support_ordering: fields
                .get("SupportOrdering")
                .map(|v| v == "true")
                .unwrap_or(false),
            enable_express: fields
                .get("EnableExpress")
                .map(|v| v == "true")
                .unwrap_or(false),
        })
    }

    async fn create_topic(&self, topic_name: &str, props: &TopicProperties) -> AdminResult<()> {
        let body = Self::topic_description_xml(props);
        self.put_entity(topic_name, body, false).await?;
        info!(topic = %topic_name, "Topic created");
        Ok(())
    }

    async fn update_topic(&self, topic_name: &str, props: &TopicProperties) -> AdminResult<()> {
        let body = Self::topic_description_xml(props);
        self.put_entity(topic_name, body, true).await?;
        info!(topic = %topic_name, "Topic updated");
        Ok(())
    }

    async fn delete_topic(&self, topic_name: &str) -> AdminResult<()> {
        let auth = self.auth().await?;
        let resp = self
            .http
            .delete(self.url(topic_name))
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| AdminError::Failed(e.to_string()))?;
        match resp.status().as_u16() {
            s if s < 300 => {
                info!(topic = %topic_name, "Topic deleted");
                Ok(())
            }
            404 => Err(AdminError::NotFound),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(AdminError::Failed(format!("HTTP {s}: {body}")))
            }
        }
    }

    async fn list_topics(&self) -> AdminResult<Vec<String>> {
        let auth = self.auth().await?;
        let resp = self
            .http
            .get(self.url("$Resources/Topics"))
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| AdminError::Failed(e.to_string()))?;
        if resp.status().as_u16() >= 300 {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AdminError::Failed(format!("HTTP {status}: {body}")));
        }
        let xml = resp
            .text()
            .await
            .map_err(|e| AdminError::Failed(e.to_string()))?;
        Ok(extract_entry_titles(&xml))
    }

    async fn create_subscription(
        &self,
        topic_name: &str,
        spec: &SubscriptionSpec,
    ) -> AdminResult<()> {
        let path = format!("{topic_name}/subscriptions/{}", spec.name);
        match self
            .put_entity(&path, Self::subscription_description_xml(spec), false)
            .await
        {
            Ok(()) | Err(AdminError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }

        if let Some(filter) = &spec.filter_rule {
            // Replace the accept-all default rule with the proxy filter.
            let auth = self.auth().await?;
            let default_rule = format!("{path}/rules/$Default");
            let resp = self
                .http
                .delete(self.url(&default_rule))
                .header("Authorization", &auth)
                .send()
                .await
                .map_err(|e| AdminError::Failed(e.to_string()))?;
            debug!(
                subscription = %spec.name,
                status = resp.status().as_u16(),
                "Default rule removed"
            );

            let rule_path = format!("{path}/rules/ProxyFilter");
            match self
                .put_entity(&rule_path, Self::sql_rule_xml(filter), false)
                .await
            {
                Ok(()) | Err(AdminError::AlreadyExists) => {}
                Err(e) => return Err(e),
            }
            info!(subscription = %spec.name, filter = %filter, "Subscription filter installed");
        }
        info!(
            subscription = %spec.name,
            topic = %topic_name,
            "Subscription provisioned"
        );
        Ok(())
    }

    async fn delete_subscription(
        &self,
        topic_name: &str,
        subscription_name: &str,
    ) -> AdminResult<()> {
        let auth = self.auth().await?;
        let path = format!("{topic_name}/subscriptions/{subscription_name}");
        let resp = self
            .http
            .delete(self.url(&path))
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| AdminError::Failed(e.to_string()))?;
        match resp.status().as_u16() {
            s if s < 300 => Ok(()),
            404 => Err(AdminError::NotFound),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(AdminError::Failed(format!("HTTP {s}: {body}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_encode_decode() {
        assert_eq!(encode_duration_secs(3600), "PT3600S");
        assert_eq!(decode_duration_secs("PT3600S"), Some(3600));
        assert_eq!(decode_duration_secs("PT1H"), Some(3600));
        assert_eq!(decode_duration_secs("PT10M"), Some(600));
        assert_eq!(decode_duration_secs("P1DT2H"), Some(93_600));
        assert_eq!(decode_duration_secs("PT5.5S"), Some(5));
        assert_eq!(decode_duration_secs("bogus"), None);
    }

    #[test]
    fn topic_properties_diff_tracks_reconciled_fields() {
        let config = TopicGroupConfig {
            name: "review".to_string(),
            description: String::new(),
            max_message_size_mb: 1,
            message_ttl_seconds: 3600,
            enable_partitioning: true,
            duplicate_detection_window_minutes: 10,
        };
        let props = TopicProperties::from_group(&config);
        assert!(props.support_ordering);
        assert!(props.requires_duplicate_detection);
        assert!(!props.enable_express);
        assert_eq!(props.max_size_in_megabytes, 1024);

        let mut live = props.clone();
        assert!(!props.differs_from(&live));
        live.default_message_ttl_secs = 7200;
        assert!(props.differs_from(&live));
        // Partitioning cannot change in place and is not reconciled.
        let mut partition_flip = props.clone();
        partition_flip.enable_partitioning = false;
        assert!(!props.differs_from(&partition_flip));
    }

    #[test]
    fn parses_topic_description_xml() {
        let xml = r#"<entry xmlns="http://www.w3.org/2005/Atom">
            <title>a2a.review.requests</title>
            <content type="application/xml">
              <TopicDescription xmlns="http://schemas.microsoft.com/netservices/2010/10/servicebus/connect">
                <DefaultMessageTimeToLive>PT1H</DefaultMessageTimeToLive>
                <MaxSizeInMegabytes>1024</MaxSizeInMegabytes>
                <RequiresDuplicateDetection>true</RequiresDuplicateDetection>
                <DuplicateDetectionHistoryTimeWindow>PT10M</DuplicateDetectionHistoryTimeWindow>
                <EnablePartitioning>true</EnablePartitioning>
                <SupportOrdering>true</SupportOrdering>
                <EnableExpress>false</EnableExpress>
              </TopicDescription>
            </content></entry>"#;
        let fields = extract_elements(xml, &["DefaultMessageTimeToLive", "MaxSizeInMegabytes"]);
        assert_eq!(fields["DefaultMessageTimeToLive"], "PT1H");
        assert_eq!(fields["MaxSizeInMegabytes"], "1024");
    }

    #[test]
    fn parses_feed_titles() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
            <title>Topics</title>
            <entry><title>a2a.review.requests</title></entry>
            <entry><title>a2a.review.responses</title></entry>
        </feed>"#;
        let titles = extract_entry_titles(xml);
        assert_eq!(titles, vec!["a2a.review.requests", "a2a.review.responses"]);
    }
}
