//! Common data types for pubsub-testkit.

pub mod validation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Default ack deadline for new subscriptions, in seconds.
pub const DEFAULT_ACK_DEADLINE_SECONDS: u32 = 10;

/// Default message retention (7 days), in seconds.
pub const DEFAULT_RETENTION_SECONDS: u32 = 604_800;

/// Default max delivery attempts for a dead-letter policy.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Topic name a subscription reports once its topic has been deleted.
pub const DELETED_TOPIC: &str = "_deleted-topic_";

/// Unique message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new random message ID.
    pub fn new() -> Self {
        MessageId(Uuid::new_v4().to_string())
    }

    /// Create a message ID from a string.
    pub fn from_string(s: String) -> Self {
        MessageId(s)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message attributes.
pub type MessageAttributes = HashMap<String, String>;

/// A published message as stored by the emulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned message ID.
    pub id: MessageId,
    /// Payload.
    pub data: Vec<u8>,
    /// Message attributes.
    pub attributes: MessageAttributes,
    /// Ordering key, if the publisher set one.
    pub ordering_key: Option<String>,
    /// Time the emulator accepted the message.
    pub publish_time: DateTime<Utc>,
}

impl Message {
    /// Build a freshly published message with a new ID.
    pub fn new(data: Vec<u8>, attributes: MessageAttributes, ordering_key: Option<String>) -> Self {
        Self {
            id: MessageId::new(),
            data,
            attributes,
            ordering_key: ordering_key.filter(|k| !k.is_empty()),
            publish_time: Utc::now(),
        }
    }
}

/// Topic configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Full resource name (`projects/{project}/topics/{topic}`).
    pub name: String,
    /// Labels.
    pub labels: HashMap<String, String>,
    /// Message retention duration in seconds.
    pub message_retention_duration: u32,
}

impl TopicConfig {
    /// Topic with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: HashMap::new(),
            message_retention_duration: DEFAULT_RETENTION_SECONDS,
        }
    }
}

/// Subscription configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Full resource name (`projects/{project}/subscriptions/{subscription}`).
    pub name: String,
    /// Full topic resource name.
    pub topic: String,
    /// Ack deadline in seconds (10-600).
    pub ack_deadline_seconds: u32,
    /// Push delivery; `None` for pull subscriptions.
    pub push_config: Option<PushConfig>,
    /// Push retry policy.
    pub retry_policy: Option<RetryPolicy>,
    /// Dead letter policy.
    pub dead_letter_policy: Option<DeadLetterPolicy>,
    /// Enable message ordering.
    pub enable_message_ordering: bool,
    /// Message retention duration in seconds.
    pub message_retention_duration: u32,
    /// Labels.
    pub labels: HashMap<String, String>,
}

impl SubscriptionConfig {
    /// Pull subscription with default settings.
    pub fn new(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            ack_deadline_seconds: DEFAULT_ACK_DEADLINE_SECONDS,
            push_config: None,
            retry_policy: None,
            dead_letter_policy: None,
            enable_message_ordering: false,
            message_retention_duration: DEFAULT_RETENTION_SECONDS,
            labels: HashMap::new(),
        }
    }

    /// Whether messages are pushed to an endpoint instead of pulled.
    pub fn is_push(&self) -> bool {
        self.push_config.is_some()
    }
}

/// Push endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConfig {
    /// HTTP endpoint receiving the push envelope.
    pub endpoint: String,
    /// Endpoint attributes.
    pub attributes: HashMap<String, String>,
    /// Per-request timeout in seconds.
    pub timeout_seconds: Option<u32>,
}

/// Retry policy for push delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Minimum backoff in seconds.
    pub min_backoff_seconds: u32,
    /// Maximum backoff in seconds.
    pub max_backoff_seconds: u32,
    /// Delivery attempts before the message is dead-lettered or dropped.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_backoff_seconds: 10,
            max_backoff_seconds: 600,
            max_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
        }
    }
}

/// Dead letter policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterPolicy {
    /// Full resource name of the dead-letter topic.
    pub dead_letter_topic: String,
    /// Max delivery attempts (5-100).
    pub max_delivery_attempts: u32,
}

/// Subscription statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    /// Messages waiting to be delivered.
    pub backlog: u64,
    /// Messages delivered but not yet acknowledged.
    pub outstanding: u64,
}
