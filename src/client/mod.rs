//! REST client adapter for Pub/Sub emulators.
//!
//! [`PubSub`] is the narrow data-plane surface application code depends on;
//! [`PubSubClient`] implements it over the REST v1 API and adds the admin
//! calls tests need to set up topics and subscriptions. It works against the
//! embedded emulator, the Cloud SDK emulator, or anything else speaking
//! REST v1.
//!
//! Topic and subscription arguments may be bare ids (`orders`) or full
//! resource names (`projects/p/topics/orders`); bare ids are qualified with
//! the client's project.

pub mod subscriber;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tracing::debug;

use crate::emulator::Emulator;
use crate::pubsub::types::{
    AcknowledgeRequest, DeadLetterPolicy, ErrorResponse, ListSubscriptionsResponse,
    ListTopicSubscriptionsResponse, ListTopicsResponse, ModifyAckDeadlineRequest,
    ModifyPushConfigRequest, PublishRequest, PublishResponse, PubsubMessage, PullRequest,
    PullResponse, PushConfig, RetryPolicy, Subscription, Topic,
};
use crate::storage::ReceivedMessage;
use crate::types::validation::ResourceName;
use crate::types::{Message, MessageAttributes, MessageId};
use crate::{Error, Result};

pub use subscriber::{MessageHandler, Subscriber, SubscriberHandle, SubscriberStats};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Data-plane operations of a Pub/Sub service.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish messages; returns their ids in order.
    async fn publish(&self, topic: &str, messages: Vec<OutgoingMessage>) -> Result<Vec<MessageId>>;

    /// Pull up to `max_messages` without waiting.
    async fn pull(&self, subscription: &str, max_messages: u32) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge deliveries.
    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<()>;

    /// Extend deliveries' deadlines; 0 nacks them.
    async fn modify_ack_deadline(&self, subscription: &str, ack_ids: &[String], seconds: u32) -> Result<()>;
}

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    /// Payload.
    pub data: Vec<u8>,
    /// Attributes.
    pub attributes: MessageAttributes,
    /// Ordering key.
    pub ordering_key: Option<String>,
}

impl OutgoingMessage {
    /// Message with `data` as payload.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set the ordering key.
    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }
}

impl From<OutgoingMessage> for PubsubMessage {
    fn from(message: OutgoingMessage) -> Self {
        PubsubMessage {
            data: message.data,
            attributes: (!message.attributes.is_empty()).then_some(message.attributes),
            message_id: None,
            publish_time: None,
            ordering_key: message.ordering_key,
        }
    }
}

/// Settings for [`PubSubClient::create_subscription`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    ack_deadline_seconds: Option<u32>,
    push_endpoint: Option<String>,
    enable_message_ordering: bool,
    dead_letter: Option<(String, u32)>,
    retry_backoff: Option<(Duration, Duration)>,
    labels: HashMap<String, String>,
}

impl SubscriptionOptions {
    /// Pull subscription with server defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ack deadline in seconds (10-600).
    pub fn ack_deadline(mut self, seconds: u32) -> Self {
        self.ack_deadline_seconds = Some(seconds);
        self
    }

    /// Deliver by POSTing to `endpoint` instead of waiting for pulls.
    pub fn push_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.push_endpoint = Some(endpoint.into());
        self
    }

    /// Deliver messages sharing an ordering key in publish order.
    ///
    /// Pull holds back a key while one of its messages is outstanding; push
    /// sends one message per key at a time, retries included.
    pub fn ordered(mut self) -> Self {
        self.enable_message_ordering = true;
        self
    }

    /// Forward messages to `topic` after `max_delivery_attempts` deliveries.
    pub fn dead_letter(mut self, topic: impl Into<String>, max_delivery_attempts: u32) -> Self {
        self.dead_letter = Some((topic.into(), max_delivery_attempts));
        self
    }

    /// Push retry backoff bounds.
    pub fn retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.retry_backoff = Some((min, max));
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    fn into_wire(self, project: &str, topic: String) -> Subscription {
        Subscription {
            name: None,
            topic,
            push_config: self.push_endpoint.map(|endpoint| PushConfig {
                push_endpoint: endpoint,
                attributes: None,
            }),
            ack_deadline_seconds: self.ack_deadline_seconds.map(i64::from),
            message_retention_duration: None,
            labels: (!self.labels.is_empty()).then_some(self.labels),
            enable_message_ordering: self.enable_message_ordering.then_some(true),
            dead_letter_policy: self.dead_letter.map(|(topic, attempts)| DeadLetterPolicy {
                dead_letter_topic: ResourceName::qualify_topic(project, &topic),
                max_delivery_attempts: Some(attempts as i32),
            }),
            retry_policy: self.retry_backoff.map(|(min, max)| RetryPolicy {
                minimum_backoff: Some(format!("{}s", min.as_secs())),
                maximum_backoff: Some(format!("{}s", max.as_secs())),
            }),
        }
    }
}

/// Which resource a request is about, for mapping 404/409 to typed errors.
enum Resource<'a> {
    Topic(&'a str),
    Subscription(&'a str),
}

impl Resource<'_> {
    fn not_found(&self) -> Error {
        match self {
            Resource::Topic(name) => Error::TopicNotFound(name.to_string()),
            Resource::Subscription(name) => Error::SubscriptionNotFound(name.to_string()),
        }
    }

    fn name(&self) -> &str {
        match self {
            Resource::Topic(name) | Resource::Subscription(name) => name,
        }
    }
}

/// REST v1 client.
#[derive(Clone)]
pub struct PubSubClient {
    http: Client,
    endpoint: String,
    project: String,
}

impl PubSubClient {
    /// Client for the REST API at `endpoint` (e.g. `http://localhost:8085`).
    pub fn new(endpoint: impl Into<String>, project: impl Into<String>) -> Result<Self> {
        let http = Client::builder().timeout(DEFAULT_REQUEST_TIMEOUT).build()?;
        Ok(Self::with_http_client(http, endpoint, project))
    }

    /// Client reusing an existing `reqwest::Client`.
    pub fn with_http_client(http: Client, endpoint: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            project: project.into(),
        }
    }

    /// Client for a running emulator.
    pub fn for_emulator(emulator: &Emulator, project: impl Into<String>) -> Result<Self> {
        Self::new(emulator.endpoint(), project)
    }

    /// Base URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Project bare ids are qualified with.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Full topic name for `topic`.
    pub fn topic_name(&self, topic: &str) -> String {
        ResourceName::qualify_topic(&self.project, topic)
    }

    /// Full subscription name for `subscription`.
    pub fn subscription_name(&self, subscription: &str) -> String {
        ResourceName::qualify_subscription(&self.project, subscription)
    }

    fn url(&self, name: &str) -> String {
        format!("{}/v1/{}", self.endpoint, name)
    }

    /// Send a request and decode the JSON answer.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, resource: Resource<'_>) -> Result<T> {
        let response = request.send().await?;
        decode(response, resource).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, url: String, body: &B, resource: Resource<'_>) -> Result<T> {
        self.send(self.http.post(url).json(body), resource).await
    }

    // ------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------

    /// Create a topic.
    pub async fn create_topic(&self, topic: &str) -> Result<Topic> {
        let name = self.topic_name(topic);
        self.send(self.http.put(self.url(&name)).json(&Topic::default()), Resource::Topic(&name))
            .await
    }

    /// Get a topic.
    pub async fn get_topic(&self, topic: &str) -> Result<Topic> {
        let name = self.topic_name(topic);
        self.send(self.http.get(self.url(&name)), Resource::Topic(&name)).await
    }

    /// Delete a topic. Its subscriptions stay, detached.
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        let name = self.topic_name(topic);
        let _: IgnoredAny = self.send(self.http.delete(self.url(&name)), Resource::Topic(&name)).await?;
        Ok(())
    }

    /// All topics in the client's project, following pages.
    pub async fn list_topics(&self) -> Result<Vec<Topic>> {
        let url = self.url(&format!("projects/{}/topics", self.project));
        let mut topics = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.http.get(&url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: ListTopicsResponse = self.send(request, Resource::Topic(&url)).await?;
            topics.extend(page.topics);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => return Ok(topics),
            }
        }
    }

    /// Names of the subscriptions attached to `topic`.
    pub async fn list_topic_subscriptions(&self, topic: &str) -> Result<Vec<String>> {
        let name = self.topic_name(topic);
        let url = format!("{}/subscriptions", self.url(&name));
        let response: ListTopicSubscriptionsResponse =
            self.send(self.http.get(url), Resource::Topic(&name)).await?;
        Ok(response.subscriptions)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Create a subscription on `topic`.
    pub async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        let name = self.subscription_name(subscription);
        let topic = self.topic_name(topic);
        let body = options.into_wire(&self.project, topic.clone());

        let response = self.http.put(self.url(&name)).json(&body).send().await?;
        // 404 here means the topic is missing, not the subscription.
        let resource = if response.status() == StatusCode::NOT_FOUND {
            Resource::Topic(&topic)
        } else {
            Resource::Subscription(&name)
        };
        decode(response, resource).await
    }

    /// Get a subscription.
    pub async fn get_subscription(&self, subscription: &str) -> Result<Subscription> {
        let name = self.subscription_name(subscription);
        self.send(self.http.get(self.url(&name)), Resource::Subscription(&name)).await
    }

    /// Delete a subscription and its backlog.
    pub async fn delete_subscription(&self, subscription: &str) -> Result<()> {
        let name = self.subscription_name(subscription);
        let _: IgnoredAny = self
            .send(self.http.delete(self.url(&name)), Resource::Subscription(&name))
            .await?;
        Ok(())
    }

    /// All subscriptions in the client's project, following pages.
    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let url = self.url(&format!("projects/{}/subscriptions", self.project));
        let mut subscriptions = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.http.get(&url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: ListSubscriptionsResponse = self.send(request, Resource::Subscription(&url)).await?;
            subscriptions.extend(page.subscriptions);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => return Ok(subscriptions),
            }
        }
    }

    /// Switch a subscription to push (`Some(endpoint)`) or pull (`None`).
    pub async fn modify_push_config(&self, subscription: &str, endpoint: Option<&str>) -> Result<()> {
        let name = self.subscription_name(subscription);
        let body = ModifyPushConfigRequest {
            push_config: endpoint.map(|e| PushConfig {
                push_endpoint: e.to_string(),
                attributes: None,
            }),
        };
        let _: IgnoredAny = self
            .post(format!("{}:modifyPushConfig", self.url(&name)), &body, Resource::Subscription(&name))
            .await?;
        Ok(())
    }

    /// Nack deliveries for immediate redelivery.
    pub async fn nack(&self, subscription: &str, ack_ids: &[String]) -> Result<()> {
        self.modify_ack_deadline(subscription, ack_ids, 0).await
    }

    // ------------------------------------------------------------------
    // Receive helpers
    // ------------------------------------------------------------------

    /// Pull until `n` messages arrived or `timeout` elapsed. Does not ack.
    pub async fn receive(&self, subscription: &str, n: usize, timeout: Duration) -> Result<Vec<ReceivedMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut received = Vec::with_capacity(n);

        while received.len() < n {
            let wanted = (n - received.len()).min(crate::storage::MAX_PULL_MESSAGES as usize) as u32;
            let batch = self.pull(subscription, wanted).await?;
            if batch.is_empty() {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::Timeout(timeout));
                }
                tokio::time::sleep(RECEIVE_POLL_INTERVAL).await;
            }
            received.extend(batch);
        }
        Ok(received)
    }

    /// Pull until one message arrived or `timeout` elapsed. Does not ack.
    pub async fn receive_one(&self, subscription: &str, timeout: Duration) -> Result<ReceivedMessage> {
        let mut received = self.receive(subscription, 1, timeout).await?;
        received
            .pop()
            .ok_or_else(|| Error::Internal("receive returned no message".to_string()))
    }
}

/// Decode a JSON answer, mapping error statuses to typed errors.
async fn decode<T: DeserializeOwned>(response: reqwest::Response, resource: Resource<'_>) -> Result<T> {
    let status = response.status();
    let bytes = response.bytes().await?;

    if status.is_success() {
        // Deletes may answer with an empty body.
        let body: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
            b"{}"
        } else {
            &bytes
        };
        return Ok(serde_json::from_slice(body)?);
    }

    let message = serde_json::from_slice::<ErrorResponse>(&bytes)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
    debug!(status = status.as_u16(), resource = %resource.name(), "Pub/Sub request failed: {}", message);

    Err(match status {
        StatusCode::NOT_FOUND => resource.not_found(),
        StatusCode::CONFLICT => Error::AlreadyExists(resource.name().to_string()),
        _ => Error::Api {
            status: status.as_u16(),
            message,
        },
    })
}

fn received_from_wire(wire: crate::pubsub::types::ReceivedMessage) -> ReceivedMessage {
    let publish_time = wire
        .message
        .publish_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    ReceivedMessage {
        ack_id: wire.ack_id,
        message: Message {
            id: MessageId::from_string(wire.message.message_id.unwrap_or_default()),
            data: wire.message.data,
            attributes: wire.message.attributes.unwrap_or_default(),
            ordering_key: wire.message.ordering_key.filter(|k| !k.is_empty()),
            publish_time,
        },
        delivery_attempt: wire
            .delivery_attempt
            .and_then(|a| u32::try_from(a).ok())
            .unwrap_or(0),
    }
}

#[async_trait]
impl PubSub for PubSubClient {
    async fn publish(&self, topic: &str, messages: Vec<OutgoingMessage>) -> Result<Vec<MessageId>> {
        let name = self.topic_name(topic);
        let body = PublishRequest {
            messages: messages.into_iter().map(PubsubMessage::from).collect(),
        };
        let response: PublishResponse = self
            .post(format!("{}:publish", self.url(&name)), &body, Resource::Topic(&name))
            .await?;
        Ok(response.message_ids.into_iter().map(MessageId::from_string).collect())
    }

    async fn pull(&self, subscription: &str, max_messages: u32) -> Result<Vec<ReceivedMessage>> {
        let name = self.subscription_name(subscription);
        let body = PullRequest {
            max_messages: max_messages.max(1) as i32,
            return_immediately: true,
        };
        let response: PullResponse = self
            .post(format!("{}:pull", self.url(&name)), &body, Resource::Subscription(&name))
            .await?;
        Ok(response.received_messages.into_iter().map(received_from_wire).collect())
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<()> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let name = self.subscription_name(subscription);
        let body = AcknowledgeRequest {
            ack_ids: ack_ids.to_vec(),
        };
        let _: IgnoredAny = self
            .post(format!("{}:acknowledge", self.url(&name)), &body, Resource::Subscription(&name))
            .await?;
        Ok(())
    }

    async fn modify_ack_deadline(&self, subscription: &str, ack_ids: &[String], seconds: u32) -> Result<()> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let name = self.subscription_name(subscription);
        let body = ModifyAckDeadlineRequest {
            ack_ids: ack_ids.to_vec(),
            ack_deadline_seconds: i64::from(seconds),
        };
        let _: IgnoredAny = self
            .post(
                format!("{}:modifyAckDeadline", self.url(&name)),
                &body,
                Resource::Subscription(&name),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage::new("hello")
            .with_attribute("kind", "greeting")
            .with_ordering_key("user-1");
        let wire = PubsubMessage::from(message);

        assert_eq!(wire.data, b"hello");
        assert_eq!(wire.attributes.unwrap().get("kind").map(String::as_str), Some("greeting"));
        assert_eq!(wire.ordering_key.as_deref(), Some("user-1"));
    }

    #[test]
    fn test_names_are_qualified_with_project() {
        let client = PubSubClient::new("http://localhost:8085/", "test-project").unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8085");
        assert_eq!(client.topic_name("orders"), "projects/test-project/topics/orders");
        assert_eq!(
            client.subscription_name("projects/other/subscriptions/s"),
            "projects/other/subscriptions/s"
        );
        assert_eq!(
            client.url("projects/test-project/topics/orders"),
            "http://localhost:8085/v1/projects/test-project/topics/orders"
        );
    }

    #[test]
    fn test_subscription_options_wire() {
        let wire = SubscriptionOptions::new()
            .ack_deadline(30)
            .push_endpoint("http://127.0.0.1:9000/push")
            .dead_letter("orders-dead", 5)
            .retry_backoff(Duration::from_secs(1), Duration::from_secs(4))
            .ordered()
            .into_wire("test-project", "projects/test-project/topics/orders".to_string());

        assert_eq!(wire.ack_deadline_seconds, Some(30));
        assert_eq!(wire.enable_message_ordering, Some(true));
        assert_eq!(
            wire.dead_letter_policy.unwrap().dead_letter_topic,
            "projects/test-project/topics/orders-dead"
        );
        assert_eq!(wire.retry_policy.unwrap().minimum_backoff.as_deref(), Some("1s"));
        assert_eq!(
            wire.push_config.unwrap().push_endpoint,
            "http://127.0.0.1:9000/push"
        );
    }

    #[test]
    fn test_received_from_wire_without_delivery_attempt() {
        let wire = crate::pubsub::types::ReceivedMessage {
            ack_id: "ack-1".to_string(),
            message: PubsubMessage {
                data: b"x".to_vec(),
                message_id: Some("7".to_string()),
                publish_time: Some("2024-05-01T12:00:00Z".to_string()),
                ..Default::default()
            },
            delivery_attempt: None,
        };
        let received = received_from_wire(wire);
        assert_eq!(received.message.id.0, "7");
        assert_eq!(received.delivery_attempt, 0);
        assert_eq!(received.message.publish_time.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }
}
