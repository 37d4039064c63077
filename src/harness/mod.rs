//! Per-test Pub/Sub environment.
//!
//! ```no_run
//! # async fn example() -> pubsub_testkit::Result<()> {
//! use pubsub_testkit::harness::PubSubTestEnv;
//! use pubsub_testkit::client::{OutgoingMessage, PubSub};
//!
//! let env = PubSubTestEnv::start().await?;
//! let (topic, subscription) = env.topic_with_subscription("orders").await?;
//! env.client().publish(&topic, vec![OutgoingMessage::new("hello")]).await?;
//! let received = env.client().receive_one(&subscription, std::time::Duration::from_secs(5)).await?;
//! assert_eq!(received.message.data, b"hello");
//! env.stop().await;
//! # Ok(())
//! # }
//! ```

use tracing::info;
use uuid::Uuid;

use crate::client::{PubSubClient, SubscriptionOptions};
use crate::config::TestkitConfig;
use crate::emulator::Emulator;
use crate::pubsub::types::{Subscription, Topic};
use crate::Result;

/// An emulator plus a client for it, owned by one test.
pub struct PubSubTestEnv {
    emulator: Emulator,
    client: PubSubClient,
}

impl PubSubTestEnv {
    /// Start with defaults and environment overrides.
    pub async fn start() -> Result<Self> {
        Self::start_with(TestkitConfig::from_env()?).await
    }

    /// Start with an explicit configuration.
    pub async fn start_with(config: TestkitConfig) -> Result<Self> {
        crate::logging::init(&config.logging);

        let emulator = Emulator::start(&config).await?;
        let client = PubSubClient::for_emulator(&emulator, config.pubsub.project_id.clone())?;
        info!(
            endpoint = %emulator.endpoint(),
            project = %config.pubsub.project_id,
            "Pub/Sub test environment ready"
        );
        Ok(Self { emulator, client })
    }

    /// Client for this environment's emulator and project.
    pub fn client(&self) -> &PubSubClient {
        &self.client
    }

    /// Project resources are created in.
    pub fn project(&self) -> &str {
        self.client.project()
    }

    /// The running emulator.
    pub fn emulator(&self) -> &Emulator {
        &self.emulator
    }

    /// Create a topic.
    pub async fn create_topic(&self, id: &str) -> Result<Topic> {
        self.client.create_topic(id).await
    }

    /// Create a subscription on `topic`.
    pub async fn create_subscription(
        &self,
        id: &str,
        topic: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        self.client.create_subscription(id, topic, options).await
    }

    /// Fresh topic and pull subscription; returns their ids.
    pub async fn topic_with_subscription(&self, prefix: &str) -> Result<(String, String)> {
        let topic = unique_id(prefix);
        let subscription = unique_id(&format!("{}-sub", prefix));
        self.create_topic(&topic).await?;
        self.create_subscription(&subscription, &topic, SubscriptionOptions::new())
            .await?;
        Ok((topic, subscription))
    }

    /// Fresh push subscription on `topic` delivering to `endpoint_url`; returns its id.
    pub async fn push_subscription(&self, topic: &str, endpoint_url: &str) -> Result<String> {
        let subscription = unique_id("push-sub");
        self.create_subscription(
            &subscription,
            topic,
            SubscriptionOptions::new().push_endpoint(endpoint_url),
        )
        .await?;
        Ok(subscription)
    }

    /// Stop the emulator.
    pub async fn stop(self) {
        self.emulator.stop().await;
    }
}

/// `prefix-<uuid>`, unique per call and valid as a topic or subscription id.
pub fn unique_id(prefix: &str) -> String {
    let prefix = if prefix.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        prefix.to_string()
    } else {
        format!("t{}", prefix)
    };
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::validation::{validate_subscription_id, validate_topic_id};

    #[test]
    fn test_unique_id_is_valid_and_unique() {
        let a = unique_id("orders");
        let b = unique_id("orders");
        assert_ne!(a, b);
        assert!(a.starts_with("orders-"));
        validate_topic_id(&a).unwrap();
        validate_subscription_id(&b).unwrap();
    }

    #[test]
    fn test_unique_id_fixes_leading_digit() {
        let id = unique_id("1st");
        assert!(id.starts_with("t1st-"));
        validate_topic_id(&id).unwrap();
    }

    #[tokio::test]
    async fn test_env_creates_resources_in_project() {
        let env = PubSubTestEnv::start_with(TestkitConfig::default()).await.unwrap();
        let (topic, subscription) = env.topic_with_subscription("env").await.unwrap();

        let subs = env.client().list_topic_subscriptions(&topic).await.unwrap();
        assert_eq!(subs, vec![env.client().subscription_name(&subscription)]);
        assert!(env.emulator().embedded_backend().is_some());
        env.stop().await;
    }
}
