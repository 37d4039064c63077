//! JSON wire types of the Pub/Sub REST v1 API.
//!
//! Used by the embedded emulator to serve requests and by
//! [`crate::client::PubSubClient`] to build them, so both sides agree on
//! field names (`camelCase`), base64 payloads and `"<n>s"` durations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::validation::{validate_ack_deadline, validate_max_delivery_attempts, ResourceName};
use crate::types::{
    self, Message, SubscriptionConfig, TopicConfig, DEFAULT_MAX_DELIVERY_ATTEMPTS,
    DEFAULT_RETENTION_SECONDS,
};
use crate::Result;

/// Parse a protobuf JSON duration (`"600s"`, `"1.5s"`) into whole seconds.
pub fn parse_duration_secs(value: &str) -> Option<u32> {
    let secs: f64 = value.strip_suffix('s')?.parse().ok()?;
    if secs.is_sign_negative() || !secs.is_finite() {
        return None;
    }
    Some(secs.round() as u32)
}

/// Format whole seconds as a protobuf JSON duration.
pub fn format_duration_secs(secs: u32) -> String {
    format!("{}s", secs)
}

/// Error response format for Google Cloud APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Error detail information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// HTTP status code.
    pub code: u16,
    /// Error message.
    pub message: String,
    /// Error status string.
    #[serde(default)]
    pub status: String,
}

// ============================================================================
// Topics
// ============================================================================

/// Topic resource representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    /// Topic name (projects/{project}/topics/{topic}).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Labels for the topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    /// Message retention duration (e.g. `"604800s"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_retention_duration: Option<String>,
}

impl Topic {
    /// Internal config for a topic created at `name`.
    pub fn into_config(self, name: String) -> TopicConfig {
        TopicConfig {
            name,
            labels: self.labels.unwrap_or_default(),
            message_retention_duration: self
                .message_retention_duration
                .as_deref()
                .and_then(parse_duration_secs)
                .unwrap_or(DEFAULT_RETENTION_SECONDS),
        }
    }
}

impl From<&TopicConfig> for Topic {
    fn from(config: &TopicConfig) -> Self {
        Topic {
            name: Some(config.name.clone()),
            labels: if config.labels.is_empty() {
                None
            } else {
                Some(config.labels.clone())
            },
            message_retention_duration: Some(format_duration_secs(config.message_retention_duration)),
        }
    }
}

/// Response for listing topics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTopicsResponse {
    /// List of topics.
    #[serde(default)]
    pub topics: Vec<Topic>,
    /// Token for retrieving the next page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Response for listing the subscriptions of a topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTopicSubscriptionsResponse {
    /// Subscription names.
    #[serde(default)]
    pub subscriptions: Vec<String>,
    /// Token for retrieving the next page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Query parameters for list calls.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Maximum number of results.
    pub page_size: Option<usize>,
    /// Offset token from a previous page.
    pub page_token: Option<String>,
}

/// Request for publishing messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    /// Messages to publish.
    pub messages: Vec<PubsubMessage>,
}

/// A Pub/Sub message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubsubMessage {
    /// Message data (base64-encoded on the wire).
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
    /// Message attributes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, String>>,
    /// Message ID (set by server).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Publish timestamp (set by server).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_time: Option<String>,
    /// Ordering key for ordered delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
}

impl From<&Message> for PubsubMessage {
    fn from(msg: &Message) -> Self {
        PubsubMessage {
            data: msg.data.clone(),
            attributes: if msg.attributes.is_empty() {
                None
            } else {
                Some(msg.attributes.clone())
            },
            message_id: Some(msg.id.0.clone()),
            publish_time: Some(msg.publish_time.to_rfc3339()),
            ordering_key: msg.ordering_key.clone(),
        }
    }
}

/// Base64 encoding/decoding helpers
pub mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as standard base64.
    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Deserialize standard base64 (padded or not) into bytes.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let trimmed = s.trim_end_matches('=');
        base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(trimmed)
            .map_err(serde::de::Error::custom)
    }
}

/// Response for publishing messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    /// Message IDs assigned by the server.
    #[serde(default)]
    pub message_ids: Vec<String>,
}

// ============================================================================
// Subscriptions
// ============================================================================

/// A Pub/Sub subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Subscription name (projects/{project}/subscriptions/{subscription}).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Topic name (projects/{project}/topics/{topic}).
    pub topic: String,
    /// Push configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_config: Option<PushConfig>,
    /// Acknowledgment deadline in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_deadline_seconds: Option<i64>,
    /// Message retention duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_retention_duration: Option<String>,
    /// Labels for the subscription.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    /// Whether message ordering is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_message_ordering: Option<bool>,
    /// Dead letter policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_policy: Option<DeadLetterPolicy>,
    /// Retry policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl Subscription {
    /// Validate and convert into an internal config for a subscription created at `name`.
    pub fn into_config(self, name: String, default_ack_deadline: u32) -> Result<SubscriptionConfig> {
        ResourceName::parse_topic(&self.topic)?;

        let ack_deadline_seconds = match self.ack_deadline_seconds {
            // Zero means "use the default" in the Pub/Sub API.
            None | Some(0) => default_ack_deadline,
            Some(secs) => validate_ack_deadline(secs, false)?,
        };

        let push_config = match self.push_config {
            Some(push) if !push.push_endpoint.is_empty() => Some(push.into_config()?),
            _ => None,
        };

        let dead_letter_policy = match self.dead_letter_policy {
            Some(policy) => Some(policy.into_config()?),
            None => None,
        };

        Ok(SubscriptionConfig {
            name,
            topic: self.topic,
            ack_deadline_seconds,
            push_config,
            retry_policy: self.retry_policy.map(RetryPolicy::into_config),
            dead_letter_policy,
            enable_message_ordering: self.enable_message_ordering.unwrap_or(false),
            message_retention_duration: self
                .message_retention_duration
                .as_deref()
                .and_then(parse_duration_secs)
                .unwrap_or(DEFAULT_RETENTION_SECONDS),
            labels: self.labels.unwrap_or_default(),
        })
    }
}

impl From<&SubscriptionConfig> for Subscription {
    fn from(config: &SubscriptionConfig) -> Self {
        Subscription {
            name: Some(config.name.clone()),
            topic: config.topic.clone(),
            push_config: config.push_config.as_ref().map(PushConfig::from),
            ack_deadline_seconds: Some(i64::from(config.ack_deadline_seconds)),
            message_retention_duration: Some(format_duration_secs(config.message_retention_duration)),
            labels: if config.labels.is_empty() {
                None
            } else {
                Some(config.labels.clone())
            },
            enable_message_ordering: Some(config.enable_message_ordering),
            dead_letter_policy: config.dead_letter_policy.as_ref().map(|dlp| DeadLetterPolicy {
                dead_letter_topic: dlp.dead_letter_topic.clone(),
                max_delivery_attempts: Some(dlp.max_delivery_attempts as i32),
            }),
            retry_policy: config.retry_policy.as_ref().map(RetryPolicy::from),
        }
    }
}

/// Push configuration for a subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConfig {
    /// HTTP endpoint for push delivery.
    #[serde(default)]
    pub push_endpoint: String,
    /// Attributes for push delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, String>>,
}

impl PushConfig {
    /// Validate the endpoint and convert.
    pub fn into_config(self) -> Result<types::PushConfig> {
        let endpoint = reqwest::Url::parse(&self.push_endpoint).map_err(|e| {
            ValidationError::InvalidParameter {
                name: "push_endpoint".to_string(),
                reason: format!("{}: {}", self.push_endpoint, e),
            }
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ValidationError::InvalidParameter {
                name: "push_endpoint".to_string(),
                reason: format!("unsupported scheme: {}", endpoint.scheme()),
            }
            .into());
        }

        Ok(types::PushConfig {
            endpoint: self.push_endpoint,
            attributes: self.attributes.unwrap_or_default(),
            timeout_seconds: None,
        })
    }
}

impl From<&types::PushConfig> for PushConfig {
    fn from(config: &types::PushConfig) -> Self {
        PushConfig {
            push_endpoint: config.endpoint.clone(),
            attributes: if config.attributes.is_empty() {
                None
            } else {
                Some(config.attributes.clone())
            },
        }
    }
}

/// Retry policy for push delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Minimum backoff (e.g. `"10s"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_backoff: Option<String>,
    /// Maximum backoff (e.g. `"600s"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_backoff: Option<String>,
}

impl RetryPolicy {
    fn into_config(self) -> types::RetryPolicy {
        let defaults = types::RetryPolicy::default();
        let min = self
            .minimum_backoff
            .as_deref()
            .and_then(parse_duration_secs)
            .unwrap_or(defaults.min_backoff_seconds);
        let max = self
            .maximum_backoff
            .as_deref()
            .and_then(parse_duration_secs)
            .unwrap_or(defaults.max_backoff_seconds)
            .max(min);

        types::RetryPolicy {
            min_backoff_seconds: min,
            max_backoff_seconds: max,
            max_attempts: defaults.max_attempts,
        }
    }
}

impl From<&types::RetryPolicy> for RetryPolicy {
    fn from(policy: &types::RetryPolicy) -> Self {
        RetryPolicy {
            minimum_backoff: Some(format_duration_secs(policy.min_backoff_seconds)),
            maximum_backoff: Some(format_duration_secs(policy.max_backoff_seconds)),
        }
    }
}

/// Dead letter policy for a subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterPolicy {
    /// Dead letter topic name.
    pub dead_letter_topic: String,
    /// Maximum delivery attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delivery_attempts: Option<i32>,
}

impl DeadLetterPolicy {
    fn into_config(self) -> Result<types::DeadLetterPolicy> {
        ResourceName::parse_topic(&self.dead_letter_topic)?;
        let attempts = match self.max_delivery_attempts {
            None | Some(0) => DEFAULT_MAX_DELIVERY_ATTEMPTS,
            Some(n) => u32::try_from(n).map_err(|_| ValidationError::InvalidParameter {
                name: "max_delivery_attempts".to_string(),
                reason: format!("must be positive, got {}", n),
            })?,
        };
        validate_max_delivery_attempts(attempts)?;

        Ok(types::DeadLetterPolicy {
            dead_letter_topic: self.dead_letter_topic,
            max_delivery_attempts: attempts,
        })
    }
}

/// Response for listing subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSubscriptionsResponse {
    /// List of subscriptions.
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    /// Token for retrieving the next page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Request for pulling messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Maximum number of messages to return.
    #[serde(default = "default_max_messages")]
    pub max_messages: i32,
    /// Deprecated by Pub/Sub; accepted and ignored (pull never blocks here).
    #[serde(default)]
    pub return_immediately: bool,
}

fn default_max_messages() -> i32 {
    1
}

/// Response for pulling messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Received messages; the emulators omit the field when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub received_messages: Vec<ReceivedMessage>,
}

/// A received message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    /// Acknowledgment ID.
    pub ack_id: String,
    /// The message.
    pub message: PubsubMessage,
    /// Delivery attempt counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_attempt: Option<i32>,
}

/// Request for acknowledging messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeRequest {
    /// Acknowledgment IDs.
    pub ack_ids: Vec<String>,
}

/// Request for modifying acknowledgment deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyAckDeadlineRequest {
    /// Acknowledgment IDs.
    pub ack_ids: Vec<String>,
    /// New acknowledgment deadline in seconds.
    pub ack_deadline_seconds: i64,
}

/// Request for replacing a subscription's push config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyPushConfigRequest {
    /// New push config; empty endpoint or absent = pull.
    #[serde(default)]
    pub push_config: Option<PushConfig>,
}
