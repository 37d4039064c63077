//! Publisher service.
//!
//! Validates incoming messages, stores them through the backend (which fans
//! them out to pull subscriptions) and queues one push delivery per push
//! subscription attached to the topic.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::pubsub::push_queue::{DeliveryQueue, DeliveryTask};
use crate::pubsub::types::PubsubMessage;
use crate::storage::StorageBackend;
use crate::types::validation::validate_message;
use crate::types::{Message, MessageId};

/// Publishing entry point shared by the REST layer and the push workers.
#[derive(Clone)]
pub struct PublisherService {
    backend: Arc<dyn StorageBackend>,
    queue: DeliveryQueue,
}

impl PublisherService {
    /// Create a publisher over `backend`, feeding push deliveries into `queue`.
    pub fn new(backend: Arc<dyn StorageBackend>, queue: DeliveryQueue) -> Self {
        Self { backend, queue }
    }

    /// The storage backend.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// The push delivery queue.
    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Publish wire messages to `topic` (full resource name).
    ///
    /// Returns the assigned message ids in request order.
    pub async fn publish(&self, topic: &str, messages: Vec<PubsubMessage>) -> Result<Vec<MessageId>> {
        if messages.is_empty() {
            return Err(ValidationError::InvalidParameter {
                name: "messages".to_string(),
                reason: "at least one message is required".to_string(),
            }
            .into());
        }

        let messages = messages
            .into_iter()
            .map(|m| {
                let attributes = m.attributes.unwrap_or_default();
                validate_message(&m.data, &attributes)?;
                Ok(Message::new(m.data, attributes, m.ordering_key))
            })
            .collect::<Result<Vec<_>>>()?;

        self.publish_messages(topic, messages).await
    }

    /// Publish already-built messages, keeping their ids.
    pub async fn publish_messages(&self, topic: &str, messages: Vec<Message>) -> Result<Vec<MessageId>> {
        let outcome = self.backend.publish(topic, messages).await?;

        for subscription in outcome.push_subscriptions {
            let subscription = Arc::new(subscription);
            for message in &outcome.messages {
                self.queue
                    .enqueue(DeliveryTask::new(message.clone(), subscription.clone()))
                    .await;
            }
            debug!(
                subscription = %subscription.name,
                count = outcome.messages.len(),
                "Queued push deliveries"
            );
        }

        Ok(outcome.messages.into_iter().map(|m| m.id).collect())
    }
}
