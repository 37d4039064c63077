//! In-memory storage backend implementation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::EvictionPolicy;
use crate::core::ack_id::{generate_ack_id, parse_ack_id};
use crate::metrics::METRICS;
use crate::storage::{PublishOutcome, ReceivedMessage, StorageBackend, MAX_PULL_MESSAGES};
use crate::types::{
    Message, PushConfig, SubscriptionConfig, SubscriptionStats, TopicConfig, DELETED_TOPIC,
};
use crate::{Error, Result};

/// Attribute naming the subscription a dead-lettered message came from.
pub const DEAD_LETTER_SOURCE_SUBSCRIPTION: &str = "CloudPubSubDeadLetterSourceSubscription";
/// Attribute carrying how many times a dead-lettered message was delivered.
pub const DEAD_LETTER_SOURCE_DELIVERY_COUNT: &str = "CloudPubSubDeadLetterSourceDeliveryCount";

/// In-memory storage backend.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<InMemoryBackendInner>,
}

struct InMemoryBackendInner {
    state: RwLock<State>,
    config: InMemoryConfig,
}

/// Configuration for in-memory backend.
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Maximum number of messages across all subscriptions.
    pub max_messages: usize,
    /// Eviction policy when full.
    pub eviction_policy: EvictionPolicy,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: 100_000,
            eviction_policy: EvictionPolicy::DropOldest,
        }
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicConfig>,
    subscriptions: HashMap<String, SubscriptionData>,
    /// Publish order across the whole emulator; keeps requeued messages in order.
    next_seq: u64,
}

struct SubscriptionData {
    config: SubscriptionConfig,
    /// Messages waiting for delivery, in publish order.
    backlog: VecDeque<PendingMessage>,
    /// Delivered, unacknowledged messages keyed by ack id.
    outstanding: HashMap<String, OutstandingMessage>,
}

struct PendingMessage {
    seq: u64,
    message: Message,
    /// Deliveries so far on this subscription.
    delivery_attempts: u32,
}

struct OutstandingMessage {
    seq: u64,
    message: Message,
    delivery_attempts: u32,
    deadline: DateTime<Utc>,
}

impl OutstandingMessage {
    fn into_pending(self) -> PendingMessage {
        PendingMessage {
            seq: self.seq,
            message: self.message,
            delivery_attempts: self.delivery_attempts,
        }
    }
}

impl SubscriptionData {
    fn new(config: SubscriptionConfig) -> Self {
        Self {
            config,
            backlog: VecDeque::new(),
            outstanding: HashMap::new(),
        }
    }

    /// Put messages back at the front of the backlog, preserving publish order.
    fn requeue_front(&mut self, mut pending: Vec<PendingMessage>) {
        pending.sort_by_key(|p| std::cmp::Reverse(p.seq));
        for p in pending {
            self.backlog.push_front(p);
        }
    }

    /// Move outstanding messages whose deadline passed back to the backlog.
    fn requeue_expired(&mut self, now: DateTime<Utc>) -> u64 {
        let expired: Vec<String> = self
            .outstanding
            .iter()
            .filter(|(_, m)| m.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        let pending: Vec<PendingMessage> = expired
            .iter()
            .filter_map(|ack_id| self.outstanding.remove(ack_id))
            .map(OutstandingMessage::into_pending)
            .collect();
        let count = pending.len() as u64;
        self.requeue_front(pending);

        METRICS
            .ack_deadlines_expired_total
            .with_label_values(&[self.config.name.as_str()])
            .inc_by(count);
        debug!(
            subscription = %self.config.name,
            count = count,
            "Ack deadlines expired, messages returned to backlog"
        );

        count
    }

    fn total_messages(&self) -> usize {
        self.backlog.len() + self.outstanding.len()
    }
}

impl State {
    fn total_message_count(&self) -> usize {
        self.subscriptions.values().map(SubscriptionData::total_messages).sum()
    }

    fn outstanding_count(&self) -> usize {
        self.subscriptions.values().map(|s| s.outstanding.len()).sum()
    }

    fn pull_subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions
            .values()
            .filter(|s| s.config.topic == topic && !s.config.is_push())
            .count()
    }

    /// Refuse `incoming` new copies that cannot fit under the limit.
    ///
    /// Only backlog entries can be evicted, so with `DropOldest` the store is
    /// full once outstanding deliveries alone reach `max_messages`.
    fn admit(&self, limits: &InMemoryConfig, incoming: usize) -> Result<()> {
        if incoming == 0 {
            return Ok(());
        }
        let fits = match limits.eviction_policy {
            EvictionPolicy::RejectNew => self.total_message_count() + incoming <= limits.max_messages,
            EvictionPolicy::DropOldest => self.outstanding_count() < limits.max_messages,
        };
        if fits {
            Ok(())
        } else {
            Err(Error::StorageError(format!(
                "Message storage is full ({} messages), rejecting new messages",
                limits.max_messages
            )))
        }
    }

    /// Drop the oldest backlog entries across all subscriptions until the
    /// store is back under `max_messages`.
    fn evict_oldest(&mut self, max_messages: usize) {
        let mut excess = self.total_message_count().saturating_sub(max_messages);
        while excess > 0 {
            let oldest = self
                .subscriptions
                .iter()
                .filter_map(|(name, s)| s.backlog.front().map(|p| (name.clone(), p.seq)))
                .min_by_key(|(_, seq)| *seq);
            let Some((name, _)) = oldest else {
                break;
            };
            if let Some(evicted) = self
                .subscriptions
                .get_mut(&name)
                .and_then(|s| s.backlog.pop_front())
            {
                warn!(
                    subscription = %name,
                    message_id = %evicted.message.id,
                    "Evicted oldest message, storage full"
                );
            }
            excess -= 1;
        }
    }

    /// Copy a message into every pull subscription of `topic`.
    ///
    /// Returns the push subscriptions the caller still has to deliver to.
    fn fan_out(&mut self, topic: &str, message: &Message) -> Vec<SubscriptionConfig> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut push = Vec::new();
        for sub in self.subscriptions.values_mut().filter(|s| s.config.topic == topic) {
            if sub.config.is_push() {
                push.push(sub.config.clone());
                continue;
            }
            sub.backlog.push_back(PendingMessage {
                seq,
                message: message.clone(),
                delivery_attempts: 0,
            });
        }
        push
    }

    /// Forward a message that ran out of delivery attempts to the dead-letter topic.
    fn dead_letter(
        &mut self,
        limits: &InMemoryConfig,
        source: &SubscriptionConfig,
        pending: PendingMessage,
    ) {
        let Some(policy) = &source.dead_letter_policy else {
            return;
        };

        if !self.topics.contains_key(&policy.dead_letter_topic) {
            warn!(
                subscription = %source.name,
                dead_letter_topic = %policy.dead_letter_topic,
                message_id = %pending.message.id,
                "Dead-letter topic does not exist, dropping message"
            );
            return;
        }

        let incoming = self.pull_subscriber_count(&policy.dead_letter_topic);
        if let Err(e) = self.admit(limits, incoming) {
            warn!(
                subscription = %source.name,
                dead_letter_topic = %policy.dead_letter_topic,
                message_id = %pending.message.id,
                "Dropping dead-lettered message: {}",
                e
            );
            return;
        }

        let mut message = pending.message;
        message
            .attributes
            .insert(DEAD_LETTER_SOURCE_SUBSCRIPTION.to_string(), source.name.clone());
        message.attributes.insert(
            DEAD_LETTER_SOURCE_DELIVERY_COUNT.to_string(),
            pending.delivery_attempts.to_string(),
        );

        info!(
            subscription = %source.name,
            dead_letter_topic = %policy.dead_letter_topic,
            message_id = %message.id,
            delivery_attempts = pending.delivery_attempts,
            "Message exceeded max delivery attempts, forwarded to dead-letter topic"
        );
        METRICS
            .messages_dead_lettered_total
            .with_label_values(&[source.name.as_str()])
            .inc();

        let skipped = self.fan_out(&policy.dead_letter_topic, &message);
        if !skipped.is_empty() {
            warn!(
                dead_letter_topic = %policy.dead_letter_topic,
                message_id = %message.id,
                push_subscriptions = skipped.len(),
                "Pull-side dead letters are not pushed; push subscriptions on the dead-letter topic skipped"
            );
        }
        self.evict_oldest(limits.max_messages);
    }
}

impl InMemoryBackend {
    /// Create a new in-memory backend with default configuration.
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    /// Create a new in-memory backend with custom configuration.
    pub fn with_config(config: InMemoryConfig) -> Self {
        info!(
            "Initializing in-memory backend with max_messages={}, policy={:?}",
            config.max_messages, config.eviction_policy
        );

        Self {
            inner: Arc::new(InMemoryBackendInner {
                state: RwLock::new(State::default()),
                config,
            }),
        }
    }

    /// Resolve and validate an ack id against the subscription it is used on.
    fn check_ack_id(subscription: &str, ack_id: &str) -> Result<()> {
        let data = parse_ack_id(ack_id)?;
        if data.subscription != subscription {
            return Err(Error::InvalidAckId(format!(
                "{} belongs to {}, not {}",
                ack_id, data.subscription, subscription
            )));
        }
        Ok(())
    }

    fn refresh_gauges(state: &State) {
        METRICS.topic_count.set(state.topics.len() as i64);
        METRICS
            .subscription_count
            .set(state.subscriptions.len() as i64);
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn in_project(name: &str, project: &str, kind: &str) -> bool {
    name.strip_prefix("projects/")
        .and_then(|rest| rest.strip_prefix(project))
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(|rest| rest.strip_prefix(kind))
        .is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait::async_trait]
impl StorageBackend for InMemoryBackend {
    async fn create_topic(&self, config: TopicConfig) -> Result<TopicConfig> {
        debug!(topic = %config.name, "Creating topic");

        let mut state = self.inner.state.write().await;
        if state.topics.contains_key(&config.name) {
            return Err(Error::AlreadyExists(config.name.clone()));
        }

        state.topics.insert(config.name.clone(), config.clone());
        Self::refresh_gauges(&state);

        info!(topic = %config.name, "Topic created");
        Ok(config)
    }

    async fn get_topic(&self, name: &str) -> Result<TopicConfig> {
        let state = self.inner.state.read().await;
        state
            .topics
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TopicNotFound(name.to_string()))
    }

    async fn delete_topic(&self, name: &str) -> Result<()> {
        debug!(topic = %name, "Deleting topic");

        let mut state = self.inner.state.write().await;
        state
            .topics
            .remove(name)
            .ok_or_else(|| Error::TopicNotFound(name.to_string()))?;

        for sub in state.subscriptions.values_mut().filter(|s| s.config.topic == name) {
            sub.config.topic = DELETED_TOPIC.to_string();
        }
        Self::refresh_gauges(&state);

        info!(topic = %name, "Topic deleted");
        Ok(())
    }

    async fn list_topics(&self, project: &str) -> Result<Vec<TopicConfig>> {
        let state = self.inner.state.read().await;
        let mut topics: Vec<TopicConfig> = state
            .topics
            .values()
            .filter(|t| in_project(&t.name, project, "topics"))
            .cloned()
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<PublishOutcome> {
        let mut state = self.inner.state.write().await;
        if !state.topics.contains_key(topic) {
            return Err(Error::TopicNotFound(topic.to_string()));
        }

        let limits = &self.inner.config;
        let pull_subscribers = state.pull_subscriber_count(topic);
        state.admit(limits, pull_subscribers * messages.len())?;

        let mut push_subscriptions = Vec::new();
        for message in &messages {
            push_subscriptions = state.fan_out(topic, message);
        }
        state.evict_oldest(limits.max_messages);

        METRICS
            .messages_published_total
            .with_label_values(&[topic])
            .inc_by(messages.len() as u64);
        debug!(
            topic = %topic,
            count = messages.len(),
            subscriptions = pull_subscribers + push_subscriptions.len(),
            "Messages published"
        );

        Ok(PublishOutcome {
            messages,
            push_subscriptions,
        })
    }

    async fn create_subscription(&self, config: SubscriptionConfig) -> Result<SubscriptionConfig> {
        debug!(subscription = %config.name, topic = %config.topic, "Creating subscription");

        let mut state = self.inner.state.write().await;

        if state.subscriptions.contains_key(&config.name) {
            return Err(Error::AlreadyExists(config.name.clone()));
        }
        if !state.topics.contains_key(&config.topic) {
            return Err(Error::TopicNotFound(config.topic.clone()));
        }
        if let Some(policy) = &config.dead_letter_policy {
            if !state.topics.contains_key(&policy.dead_letter_topic) {
                return Err(Error::TopicNotFound(policy.dead_letter_topic.clone()));
            }
        }

        state
            .subscriptions
            .insert(config.name.clone(), SubscriptionData::new(config.clone()));
        Self::refresh_gauges(&state);

        info!(subscription = %config.name, push = config.is_push(), "Subscription created");
        Ok(config)
    }

    async fn get_subscription(&self, name: &str) -> Result<SubscriptionConfig> {
        let state = self.inner.state.read().await;
        state
            .subscriptions
            .get(name)
            .map(|s| s.config.clone())
            .ok_or_else(|| Error::SubscriptionNotFound(name.to_string()))
    }

    async fn modify_push_config(
        &self,
        name: &str,
        push_config: Option<PushConfig>,
    ) -> Result<SubscriptionConfig> {
        let mut state = self.inner.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(name)
            .ok_or_else(|| Error::SubscriptionNotFound(name.to_string()))?;

        sub.config.push_config = push_config;
        info!(subscription = %name, push = sub.config.is_push(), "Push config modified");
        Ok(sub.config.clone())
    }

    async fn delete_subscription(&self, name: &str) -> Result<()> {
        debug!(subscription = %name, "Deleting subscription");

        let mut state = self.inner.state.write().await;
        state
            .subscriptions
            .remove(name)
            .ok_or_else(|| Error::SubscriptionNotFound(name.to_string()))?;
        Self::refresh_gauges(&state);

        info!(subscription = %name, "Subscription deleted");
        Ok(())
    }

    async fn list_subscriptions(&self, project: &str) -> Result<Vec<SubscriptionConfig>> {
        let state = self.inner.state.read().await;
        let mut subs: Vec<SubscriptionConfig> = state
            .subscriptions
            .values()
            .filter(|s| in_project(&s.config.name, project, "subscriptions"))
            .map(|s| s.config.clone())
            .collect();
        subs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(subs)
    }

    async fn list_topic_subscriptions(&self, topic: &str) -> Result<Vec<String>> {
        let state = self.inner.state.read().await;
        if !state.topics.contains_key(topic) {
            return Err(Error::TopicNotFound(topic.to_string()));
        }
        let mut names: Vec<String> = state
            .subscriptions
            .values()
            .filter(|s| s.config.topic == topic)
            .map(|s| s.config.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn pull(&self, subscription: &str, max_messages: u32) -> Result<Vec<ReceivedMessage>> {
        debug!(subscription = %subscription, max_messages, "Pulling messages");

        let now = Utc::now();
        let max = max_messages.clamp(1, MAX_PULL_MESSAGES) as usize;

        let mut state = self.inner.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::SubscriptionNotFound(subscription.to_string()))?;

        sub.requeue_expired(now);

        let ordering = sub.config.enable_message_ordering;
        // Keys with an outstanding message; later messages with the key wait behind it.
        let blocked_keys: HashSet<String> = if ordering {
            sub.outstanding
                .values()
                .filter_map(|m| m.message.ordering_key.clone())
                .collect()
        } else {
            HashSet::new()
        };

        let deadline = now + Duration::seconds(i64::from(sub.config.ack_deadline_seconds));
        let max_attempts = sub
            .config
            .dead_letter_policy
            .as_ref()
            .map(|p| p.max_delivery_attempts);

        let mut received = Vec::new();
        let mut dead = Vec::new();
        let mut kept = VecDeque::with_capacity(sub.backlog.len());

        while let Some(pending) = sub.backlog.pop_front() {
            if received.len() >= max {
                kept.push_back(pending);
                continue;
            }

            if let Some(key) = &pending.message.ordering_key {
                if ordering && blocked_keys.contains(key) {
                    kept.push_back(pending);
                    continue;
                }
            }

            if max_attempts.is_some_and(|max| pending.delivery_attempts >= max) {
                dead.push(pending);
                continue;
            }

            let attempt = pending.delivery_attempts + 1;
            let ack_id = generate_ack_id(subscription, &pending.message.id);

            received.push(ReceivedMessage {
                ack_id: ack_id.clone(),
                message: pending.message.clone(),
                delivery_attempt: attempt,
            });
            sub.outstanding.insert(
                ack_id,
                OutstandingMessage {
                    seq: pending.seq,
                    message: pending.message,
                    delivery_attempts: attempt,
                    deadline,
                },
            );
        }
        sub.backlog = kept;

        let config = sub.config.clone();
        for pending in dead {
            state.dead_letter(&self.inner.config, &config, pending);
        }

        METRICS
            .messages_delivered_total
            .with_label_values(&[subscription, "pull"])
            .inc_by(received.len() as u64);
        debug!(subscription = %subscription, count = received.len(), "Messages pulled");

        Ok(received)
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<()> {
        debug!(subscription = %subscription, count = ack_ids.len(), "Acknowledging messages");

        for ack_id in ack_ids {
            Self::check_ack_id(subscription, ack_id)?;
        }

        let mut state = self.inner.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::SubscriptionNotFound(subscription.to_string()))?;

        let mut acked = 0u64;
        for ack_id in ack_ids {
            if sub.outstanding.remove(ack_id).is_some() {
                acked += 1;
            } else {
                debug!(subscription = %subscription, "Ignoring unknown or expired ack id");
            }
        }

        METRICS
            .messages_acked_total
            .with_label_values(&[subscription])
            .inc_by(acked);
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        ack_deadline_seconds: u32,
    ) -> Result<()> {
        debug!(
            subscription = %subscription,
            count = ack_ids.len(),
            ack_deadline_seconds,
            "Modifying ack deadline"
        );

        for ack_id in ack_ids {
            Self::check_ack_id(subscription, ack_id)?;
        }

        let mut state = self.inner.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::SubscriptionNotFound(subscription.to_string()))?;

        if ack_deadline_seconds == 0 {
            let nacked: Vec<PendingMessage> = ack_ids
                .iter()
                .filter_map(|ack_id| sub.outstanding.remove(ack_id))
                .map(OutstandingMessage::into_pending)
                .collect();
            METRICS
                .messages_nacked_total
                .with_label_values(&[subscription])
                .inc_by(nacked.len() as u64);
            sub.requeue_front(nacked);
            return Ok(());
        }

        let deadline = Utc::now() + Duration::seconds(i64::from(ack_deadline_seconds));
        for ack_id in ack_ids {
            if let Some(outstanding) = sub.outstanding.get_mut(ack_id) {
                outstanding.deadline = deadline;
            }
        }
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.inner.state.write().await;
        Ok(state
            .subscriptions
            .values_mut()
            .map(|s| s.requeue_expired(now))
            .sum())
    }

    async fn stats(&self, subscription: &str) -> Result<SubscriptionStats> {
        let now = Utc::now();
        let state = self.inner.state.read().await;
        let sub = state
            .subscriptions
            .get(subscription)
            .ok_or_else(|| Error::SubscriptionNotFound(subscription.to_string()))?;

        let expired = sub.outstanding.values().filter(|m| m.deadline <= now).count();
        Ok(SubscriptionStats {
            backlog: (sub.backlog.len() + expired) as u64,
            outstanding: (sub.outstanding.len() - expired) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeadLetterPolicy;

    const TOPIC: &str = "projects/test-project/topics/orders";
    const SUB: &str = "projects/test-project/subscriptions/orders-sub";

    fn message(body: &str) -> Message {
        Message::new(body.as_bytes().to_vec(), HashMap::new(), None)
    }

    async fn backend_with_subscription() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        backend.create_topic(TopicConfig::new(TOPIC)).await.unwrap();
        backend
            .create_subscription(SubscriptionConfig::new(SUB, TOPIC))
            .await
            .unwrap();
        backend
    }

    #[test]
    fn test_in_project() {
        assert!(in_project("projects/p1/topics/t", "p1", "topics"));
        assert!(!in_project("projects/p10/topics/t", "p1", "topics"));
        assert!(!in_project("projects/p1/subscriptions/s", "p1", "topics"));
    }

    #[tokio::test]
    async fn test_eviction_policy_reject_new() {
        let backend = InMemoryBackend::with_config(InMemoryConfig {
            max_messages: 2,
            eviction_policy: EvictionPolicy::RejectNew,
        });
        backend.create_topic(TopicConfig::new(TOPIC)).await.unwrap();
        backend
            .create_subscription(SubscriptionConfig::new(SUB, TOPIC))
            .await
            .unwrap();

        backend.publish(TOPIC, vec![message("1"), message("2")]).await.unwrap();
        let result = backend.publish(TOPIC, vec![message("3")]).await;
        assert!(matches!(result, Err(Error::StorageError(_))));
    }

    #[tokio::test]
    async fn test_eviction_policy_drop_oldest() {
        let backend = InMemoryBackend::with_config(InMemoryConfig {
            max_messages: 2,
            eviction_policy: EvictionPolicy::DropOldest,
        });
        backend.create_topic(TopicConfig::new(TOPIC)).await.unwrap();
        backend
            .create_subscription(SubscriptionConfig::new(SUB, TOPIC))
            .await
            .unwrap();

        backend
            .publish(TOPIC, vec![message("1"), message("2"), message("3")])
            .await
            .unwrap();

        let pulled = backend.pull(SUB, 10).await.unwrap();
        let bodies: Vec<&[u8]> = pulled.iter().map(|m| m.message.data.as_slice()).collect();
        assert_eq!(bodies, vec![b"2".as_slice(), b"3".as_slice()]);
    }

    #[tokio::test]
    async fn test_drop_oldest_rejects_when_outstanding_fills_store() {
        let backend = InMemoryBackend::with_config(InMemoryConfig {
            max_messages: 2,
            eviction_policy: EvictionPolicy::DropOldest,
        });
        backend.create_topic(TopicConfig::new(TOPIC)).await.unwrap();
        backend
            .create_subscription(SubscriptionConfig::new(SUB, TOPIC))
            .await
            .unwrap();

        backend.publish(TOPIC, vec![message("1"), message("2")]).await.unwrap();
        assert_eq!(backend.pull(SUB, 10).await.unwrap().len(), 2);

        let result = backend.publish(TOPIC, vec![message("3"), message("4")]).await;
        assert!(matches!(result, Err(Error::StorageError(_))));
        assert_eq!(
            backend.stats(SUB).await.unwrap(),
            SubscriptionStats { backlog: 0, outstanding: 2 }
        );
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest_beside_outstanding() {
        let backend = InMemoryBackend::with_config(InMemoryConfig {
            max_messages: 3,
            eviction_policy: EvictionPolicy::DropOldest,
        });
        backend.create_topic(TopicConfig::new(TOPIC)).await.unwrap();
        backend
            .create_subscription(SubscriptionConfig::new(SUB, TOPIC))
            .await
            .unwrap();

        backend.publish(TOPIC, vec![message("1")]).await.unwrap();
        backend.pull(SUB, 1).await.unwrap();
        backend
            .publish(TOPIC, vec![message("2"), message("3"), message("4"), message("5")])
            .await
            .unwrap();

        assert_eq!(
            backend.stats(SUB).await.unwrap(),
            SubscriptionStats { backlog: 2, outstanding: 1 }
        );
        let pulled = backend.pull(SUB, 10).await.unwrap();
        let bodies: Vec<&[u8]> = pulled.iter().map(|m| m.message.data.as_slice()).collect();
        assert_eq!(bodies, vec![b"4".as_slice(), b"5".as_slice()]);
    }

    #[tokio::test]
    async fn test_dead_letter_dropped_when_store_full() {
        let dlt = "projects/test-project/topics/orders-dead";
        let dl_subs = [
            "projects/test-project/subscriptions/orders-dead-a",
            "projects/test-project/subscriptions/orders-dead-b",
        ];

        let backend = InMemoryBackend::with_config(InMemoryConfig {
            max_messages: 2,
            eviction_policy: EvictionPolicy::RejectNew,
        });
        backend.create_topic(TopicConfig::new(TOPIC)).await.unwrap();
        backend.create_topic(TopicConfig::new(dlt)).await.unwrap();
        for name in dl_subs {
            backend
                .create_subscription(SubscriptionConfig::new(name, dlt))
                .await
                .unwrap();
        }
        let mut config = SubscriptionConfig::new(SUB, TOPIC);
        config.dead_letter_policy = Some(DeadLetterPolicy {
            dead_letter_topic: dlt.to_string(),
            max_delivery_attempts: 5,
        });
        backend.create_subscription(config).await.unwrap();

        backend
            .publish(TOPIC, vec![message("poison"), message("other")])
            .await
            .unwrap();
        for _ in 0..5 {
            let pulled = backend.pull(SUB, 1).await.unwrap();
            assert_eq!(pulled[0].message.data, b"poison");
            backend
                .modify_ack_deadline(SUB, &[pulled[0].ack_id.clone()], 0)
                .await
                .unwrap();
        }

        // Two dead-letter copies do not fit beside the outstanding "other".
        let pulled = backend.pull(SUB, 1).await.unwrap();
        assert_eq!(pulled[0].message.data, b"other");
        for name in dl_subs {
            assert_eq!(
                backend.stats(name).await.unwrap(),
                SubscriptionStats { backlog: 0, outstanding: 0 }
            );
        }
        assert!(backend.inner.state.read().await.total_message_count() <= 2);
    }

    #[tokio::test]
    async fn test_invalid_ack_id_subscription_mismatch() {
        let backend = backend_with_subscription().await;
        backend.publish(TOPIC, vec![message("x")]).await.unwrap();
        let pulled = backend.pull(SUB, 1).await.unwrap();

        let other = "projects/test-project/subscriptions/other-sub";
        backend
            .create_subscription(SubscriptionConfig::new(other, TOPIC))
            .await
            .unwrap();

        let result = backend.acknowledge(other, &[pulled[0].ack_id.clone()]).await;
        assert!(matches!(result, Err(Error::InvalidAckId(_))));
    }

    #[tokio::test]
    async fn test_nack_preserves_publish_order() {
        let backend = backend_with_subscription().await;
        backend
            .publish(TOPIC, vec![message("a"), message("b"), message("c")])
            .await
            .unwrap();

        let first = backend.pull(SUB, 3).await.unwrap();
        let ack_ids: Vec<String> = first.iter().rev().map(|m| m.ack_id.clone()).collect();
        backend.modify_ack_deadline(SUB, &ack_ids, 0).await.unwrap();

        let again = backend.pull(SUB, 3).await.unwrap();
        let bodies: Vec<&[u8]> = again.iter().map(|m| m.message.data.as_slice()).collect();
        assert_eq!(bodies, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
        assert!(again.iter().all(|m| m.delivery_attempt == 2));
    }

    #[tokio::test]
    async fn test_stats_count_expired_as_backlog() {
        let backend = backend_with_subscription().await;
        backend.publish(TOPIC, vec![message("x"), message("y")]).await.unwrap();

        let pulled = backend.pull(SUB, 1).await.unwrap();
        assert_eq!(
            backend.stats(SUB).await.unwrap(),
            SubscriptionStats { backlog: 1, outstanding: 1 }
        );

        // Force the deadline into the past.
        {
            let mut state = backend.inner.state.write().await;
            let sub = state.subscriptions.get_mut(SUB).unwrap();
            sub.outstanding.get_mut(&pulled[0].ack_id).unwrap().deadline =
                Utc::now() - Duration::seconds(1);
        }
        assert_eq!(
            backend.stats(SUB).await.unwrap(),
            SubscriptionStats { backlog: 2, outstanding: 0 }
        );
        assert_eq!(backend.requeue_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let dlt = "projects/test-project/topics/orders-dead";
        let dl_sub = "projects/test-project/subscriptions/orders-dead-sub";

        let backend = InMemoryBackend::new();
        backend.create_topic(TopicConfig::new(TOPIC)).await.unwrap();
        backend.create_topic(TopicConfig::new(dlt)).await.unwrap();
        backend
            .create_subscription(SubscriptionConfig::new(dl_sub, dlt))
            .await
            .unwrap();

        let mut config = SubscriptionConfig::new(SUB, TOPIC);
        config.dead_letter_policy = Some(DeadLetterPolicy {
            dead_letter_topic: dlt.to_string(),
            max_delivery_attempts: 5,
        });
        backend.create_subscription(config).await.unwrap();

        backend.publish(TOPIC, vec![message("poison")]).await.unwrap();

        for attempt in 1..=5 {
            let pulled = backend.pull(SUB, 1).await.unwrap();
            assert_eq!(pulled.len(), 1);
            assert_eq!(pulled[0].delivery_attempt, attempt);
            backend
                .modify_ack_deadline(SUB, &[pulled[0].ack_id.clone()], 0)
                .await
                .unwrap();
        }

        assert!(backend.pull(SUB, 1).await.unwrap().is_empty());

        let dead = backend.pull(dl_sub, 1).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.data, b"poison");
        assert_eq!(
            dead[0].message.attributes.get(DEAD_LETTER_SOURCE_SUBSCRIPTION).map(String::as_str),
            Some(SUB)
        );
        assert_eq!(
            dead[0].message.attributes.get(DEAD_LETTER_SOURCE_DELIVERY_COUNT).map(String::as_str),
            Some("5")
        );
    }
}
