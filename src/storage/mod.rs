//! Storage backend traits and implementations.

use crate::types::{Message, SubscriptionConfig, SubscriptionStats, TopicConfig};
use crate::Result;
use async_trait::async_trait;

pub mod memory;

/// Upper bound on messages returned by a single pull.
pub const MAX_PULL_MESSAGES: u32 = 1000;

/// A delivered message with its ack id.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Ack id for this delivery.
    pub ack_id: String,
    /// The message.
    pub message: Message,
    /// 1-based delivery attempt on this subscription; 0 when the server did not report one.
    pub delivery_attempt: u32,
}

/// Result of a publish: the stored messages and the push subscriptions to deliver them to.
#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    /// Messages as stored, with server-assigned IDs.
    pub messages: Vec<Message>,
    /// Push subscriptions attached to the topic at publish time.
    pub push_subscriptions: Vec<SubscriptionConfig>,
}

/// Storage backend trait.
///
/// Names are full resource names (`projects/{p}/topics/{t}`,
/// `projects/{p}/subscriptions/{s}`).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create a new topic.
    async fn create_topic(&self, config: TopicConfig) -> Result<TopicConfig>;

    /// Get a topic by name.
    async fn get_topic(&self, name: &str) -> Result<TopicConfig>;

    /// Delete a topic. Its subscriptions stay, detached.
    async fn delete_topic(&self, name: &str) -> Result<()>;

    /// List topics in a project.
    async fn list_topics(&self, project: &str) -> Result<Vec<TopicConfig>>;

    /// Publish messages, copying each into every pull subscription of the topic.
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<PublishOutcome>;

    /// Create a subscription.
    async fn create_subscription(&self, config: SubscriptionConfig) -> Result<SubscriptionConfig>;

    /// Get a subscription by name.
    async fn get_subscription(&self, name: &str) -> Result<SubscriptionConfig>;

    /// Replace a subscription's push config (`None` turns it into a pull subscription).
    async fn modify_push_config(
        &self,
        name: &str,
        push_config: Option<crate::types::PushConfig>,
    ) -> Result<SubscriptionConfig>;

    /// Delete a subscription and its backlog.
    async fn delete_subscription(&self, name: &str) -> Result<()>;

    /// List subscriptions in a project.
    async fn list_subscriptions(&self, project: &str) -> Result<Vec<SubscriptionConfig>>;

    /// List subscription names attached to a topic.
    async fn list_topic_subscriptions(&self, topic: &str) -> Result<Vec<String>>;

    /// Pull up to `max_messages` messages.
    async fn pull(&self, subscription: &str, max_messages: u32) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge deliveries. Unknown or expired ack ids are ignored.
    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<()>;

    /// Change the deadline of outstanding deliveries; 0 nacks them.
    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        ack_deadline_seconds: u32,
    ) -> Result<()>;

    /// Return every outstanding message whose deadline passed to its backlog.
    async fn requeue_expired(&self) -> Result<u64>;

    /// Backlog and outstanding counts for a subscription.
    async fn stats(&self, subscription: &str) -> Result<SubscriptionStats>;
}
