//! Push worker pool for HTTP delivery.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PushDeliveryConfig;
use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::pubsub::publisher::PublisherService;
use crate::pubsub::push_queue::{DeliveryQueue, DeliveryTask};
use crate::push::PushEnvelope;
use crate::storage::memory::{DEAD_LETTER_SOURCE_DELIVERY_COUNT, DEAD_LETTER_SOURCE_SUBSCRIPTION};
use crate::types::{Message, PushConfig, RetryPolicy, SubscriptionConfig};

/// Settings every worker shares.
struct WorkerContext {
    client: Client,
    publisher: PublisherService,
    default_retry: RetryPolicy,
    request_timeout: Duration,
}

/// Pool of tasks draining the [`DeliveryQueue`] into HTTP POSTs.
pub struct PushWorkerPool {
    workers: Vec<JoinHandle<()>>,
    queue: DeliveryQueue,
}

impl PushWorkerPool {
    /// Start `config.workers` workers (default `num_cpus * 2`) on the
    /// publisher's queue.
    pub fn new(publisher: PublisherService, config: &PushDeliveryConfig) -> Result<Self> {
        let num_workers = config.workers.unwrap_or_else(|| num_cpus::get() * 2).max(1);
        let client = Client::builder()
            .user_agent(format!("pubsub-testkit-push/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        let queue = publisher.queue().clone();
        let context = Arc::new(WorkerContext {
            client,
            publisher,
            default_retry: config.retry_policy.clone(),
            request_timeout: Duration::from_secs(u64::from(config.request_timeout_secs)),
        });

        let workers = (0..num_workers)
            .map(|id| spawn_worker(id, queue.clone(), context.clone()))
            .collect();

        info!("Started push worker pool with {} workers", num_workers);
        Ok(Self { workers, queue })
    }

    /// The queue the workers drain.
    pub fn queue(&self) -> DeliveryQueue {
        self.queue.clone()
    }

    /// Close the queue and wait for in-flight deliveries to finish.
    ///
    /// Deliveries still queued are dropped.
    pub async fn shutdown(self) {
        info!("Shutting down push worker pool");
        self.queue.close();

        for worker in self.workers {
            let _ = worker.await;
        }

        info!("Push worker pool shutdown complete");
    }
}

fn spawn_worker(id: usize, queue: DeliveryQueue, context: Arc<WorkerContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Push worker {} started", id);
        while let Some(task) = queue.wait_and_dequeue().await {
            let slot = task.ordering_slot();
            match handle_delivery_task(task, &context).await {
                Some(retry) => queue.enqueue(retry).await,
                None => queue.release(slot).await,
            }
        }
        debug!("Push worker {} stopped", id);
    })
}

/// The subscription's current push config, if it still exists and still pushes.
async fn current_push_config(context: &WorkerContext, subscription: &str) -> Option<PushConfig> {
    match context.publisher.backend().get_subscription(subscription).await {
        Ok(current) => current.push_config,
        Err(e) => {
            debug!(subscription = %subscription, "Dropping push delivery: {}", e);
            None
        }
    }
}

/// Attempt one delivery. Returns the retry to schedule, or `None` once the
/// message is done with (acked, dead-lettered or dropped).
async fn handle_delivery_task(task: DeliveryTask, context: &WorkerContext) -> Option<DeliveryTask> {
    let subscription = task.subscription.clone();
    let Some(push_config) = current_push_config(context, &subscription.name).await else {
        debug!(
            subscription = %subscription.name,
            message_id = %task.message.id,
            "Subscription no longer pushes, dropping delivery"
        );
        return None;
    };

    let delivery_attempt = task.attempt + 1;
    debug!(
        subscription = %subscription.name,
        message_id = %task.message.id,
        endpoint = %push_config.endpoint,
        attempt = delivery_attempt,
        "Delivering push message"
    );

    let envelope = PushEnvelope::new(&task.message, subscription.name.as_str(), delivery_attempt);
    let timeout = push_config
        .timeout_seconds
        .map(|s| Duration::from_secs(u64::from(s)))
        .unwrap_or(context.request_timeout);

    match deliver_message(&context.client, &push_config.endpoint, &envelope, timeout).await {
        Ok(()) => {
            METRICS
                .push_attempts_total
                .with_label_values(&[subscription.name.as_str(), "success"])
                .inc();
            METRICS
                .messages_delivered_total
                .with_label_values(&[subscription.name.as_str(), "push"])
                .inc();
            debug!(
                subscription = %subscription.name,
                message_id = %task.message.id,
                "Push delivery acknowledged"
            );
            None
        }
        Err(e) => {
            METRICS
                .push_attempts_total
                .with_label_values(&[subscription.name.as_str(), "failure"])
                .inc();
            warn!(
                subscription = %subscription.name,
                message_id = %task.message.id,
                attempt = delivery_attempt,
                "Push delivery failed: {}",
                e
            );

            let policy = subscription
                .retry_policy
                .clone()
                .unwrap_or_else(|| context.default_retry.clone());
            let max_attempts = max_delivery_attempts(&subscription, &policy);

            match calculate_retry(task, &policy, max_attempts) {
                Ok(retry) => Some(retry),
                Err(task) => {
                    handle_max_retries(task, &subscription, &context.publisher).await;
                    None
                }
            }
        }
    }
}

/// POST the envelope; any 2xx is an ack.
async fn deliver_message(
    client: &Client,
    endpoint: &str,
    envelope: &PushEnvelope,
    timeout: Duration,
) -> Result<()> {
    let response = client
        .post(endpoint)
        .timeout(timeout)
        .json(envelope)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::Api {
            status: status.as_u16(),
            message: format!("push endpoint {} answered {}", endpoint, status),
        })
    }
}

/// Attempts allowed before giving up: the dead-letter policy's, else the retry policy's.
fn max_delivery_attempts(subscription: &SubscriptionConfig, policy: &RetryPolicy) -> u32 {
    subscription
        .dead_letter_policy
        .as_ref()
        .map(|p| p.max_delivery_attempts)
        .unwrap_or(policy.max_attempts)
        .max(1)
}

/// Backoff before the retry following failed attempt number `attempt` (0-based):
/// `min(min_backoff * 2^attempt, max_backoff)`.
fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let secs = policy
        .min_backoff_seconds
        .saturating_mul(2_u32.saturating_pow(attempt))
        .min(policy.max_backoff_seconds);
    Duration::from_secs(u64::from(secs))
}

/// Schedule the next attempt, or hand the task back once attempts are used up.
fn calculate_retry(
    task: DeliveryTask,
    policy: &RetryPolicy,
    max_attempts: u32,
) -> std::result::Result<DeliveryTask, DeliveryTask> {
    if task.attempt + 1 >= max_attempts {
        return Err(task);
    }
    let delay = backoff(policy, task.attempt);
    Ok(task.retry_after(delay))
}

/// Out of attempts: forward to the dead-letter topic if there is one, else drop.
async fn handle_max_retries(
    task: DeliveryTask,
    subscription: &SubscriptionConfig,
    publisher: &PublisherService,
) {
    let attempts = task.attempt + 1;
    let Some(policy) = &subscription.dead_letter_policy else {
        error!(
            subscription = %subscription.name,
            message_id = %task.message.id,
            attempts,
            "Push delivery attempts exhausted, no dead-letter topic configured, dropping message"
        );
        return;
    };

    let mut attributes = task.message.attributes;
    attributes.insert(
        DEAD_LETTER_SOURCE_SUBSCRIPTION.to_string(),
        subscription.name.clone(),
    );
    attributes.insert(
        DEAD_LETTER_SOURCE_DELIVERY_COUNT.to_string(),
        attempts.to_string(),
    );
    let dead = Message::new(task.message.data, attributes, task.message.ordering_key);

    match publisher
        .publish_messages(&policy.dead_letter_topic, vec![dead])
        .await
    {
        Ok(_) => {
            METRICS
                .messages_dead_lettered_total
                .with_label_values(&[subscription.name.as_str()])
                .inc();
            info!(
                subscription = %subscription.name,
                message_id = %task.message.id,
                dead_letter_topic = %policy.dead_letter_topic,
                attempts,
                "Push delivery attempts exhausted, forwarded to dead-letter topic"
            );
        }
        Err(e) => error!(
            subscription = %subscription.name,
            dead_letter_topic = %policy.dead_letter_topic,
            "Failed to forward message to dead-letter topic: {}",
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeadLetterPolicy;
    use std::collections::HashMap;

    fn policy(min: u32, max: u32, attempts: u32) -> RetryPolicy {
        RetryPolicy {
            min_backoff_seconds: min,
            max_backoff_seconds: max,
            max_attempts: attempts,
        }
    }

    fn task(attempt: u32) -> DeliveryTask {
        let mut task = DeliveryTask::new(
            Message::new(b"m".to_vec(), HashMap::new(), None),
            Arc::new(SubscriptionConfig::new(
                "projects/test-project/subscriptions/push-sub",
                "projects/test-project/topics/orders",
            )),
        );
        task.attempt = attempt;
        task
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(10, 100, 10);
        assert_eq!(backoff(&policy, 0), Duration::from_secs(10));
        assert_eq!(backoff(&policy, 1), Duration::from_secs(20));
        assert_eq!(backoff(&policy, 3), Duration::from_secs(80));
        assert_eq!(backoff(&policy, 4), Duration::from_secs(100));
        assert_eq!(backoff(&policy, 40), Duration::from_secs(100));
    }

    #[test]
    fn test_calculate_retry_stops_at_max_attempts() {
        let policy = policy(10, 600, 5);
        let retry = calculate_retry(task(0), &policy, 5).unwrap();
        assert_eq!(retry.attempt, 1);

        let retry = calculate_retry(task(3), &policy, 5).unwrap();
        assert_eq!(retry.attempt, 4);

        let exhausted = calculate_retry(task(4), &policy, 5).unwrap_err();
        assert_eq!(exhausted.attempt, 4);
    }

    #[test]
    fn test_dead_letter_policy_sets_max_attempts() {
        let retry = policy(1, 1, 5);
        let mut subscription = SubscriptionConfig::new("projects/p/subscriptions/s", "projects/p/topics/t");
        assert_eq!(max_delivery_attempts(&subscription, &retry), 5);

        subscription.dead_letter_policy = Some(DeadLetterPolicy {
            dead_letter_topic: "projects/p/topics/dead".to_string(),
            max_delivery_attempts: 7,
        });
        assert_eq!(max_delivery_attempts(&subscription, &retry), 7);
    }
}
