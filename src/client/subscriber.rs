//! Streaming-pull style subscriber loop over any [`PubSub`] implementation.
//!
//! Pulls in batches, hands each message to a [`MessageHandler`], acks on
//! `Ok` and nacks on `Err` so the message is redelivered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::PubSub;
use crate::server::ShutdownSignal;
use crate::storage::ReceivedMessage;
use crate::{Error, Result};

const DEFAULT_MAX_MESSAGES: u32 = 10;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Processes one received message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// `Ok` acks the message, `Err` nacks it.
    async fn handle(&self, message: ReceivedMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: ReceivedMessage) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Counts reported when a subscriber stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Messages the handler accepted.
    pub acked: u64,
    /// Messages the handler rejected.
    pub nacked: u64,
}

/// Pull loop for one subscription.
pub struct Subscriber {
    client: Arc<dyn PubSub>,
    subscription: String,
    max_messages: u32,
    poll_interval: Duration,
}

impl Subscriber {
    /// Subscriber for `subscription` using `client`.
    pub fn new(client: impl PubSub + 'static, subscription: impl Into<String>) -> Self {
        Self {
            client: Arc::new(client),
            subscription: subscription.into(),
            max_messages: DEFAULT_MAX_MESSAGES,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Batch size per pull.
    pub fn max_messages(mut self, max_messages: u32) -> Self {
        self.max_messages = max_messages.max(1);
        self
    }

    /// Wait between empty pulls and after transient errors.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run until `shutdown` fires.
    ///
    /// A missing subscription ends the loop with an error; other failures
    /// are logged and retried after the poll interval.
    pub async fn run<H: MessageHandler>(
        self,
        handler: H,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<SubscriberStats> {
        let mut stats = SubscriberStats::default();
        info!(subscription = %self.subscription, "Subscriber started");

        loop {
            let batch = tokio::select! {
                _ = shutdown.recv() => break,
                batch = self.client.pull(&self.subscription, self.max_messages) => batch,
            };

            let messages = match batch {
                Ok(messages) => messages,
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) => {
                    warn!(subscription = %self.subscription, "Pull failed, retrying: {}", e);
                    Vec::new()
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            let mut acks = Vec::new();
            let mut nacks = Vec::new();
            for message in messages {
                let ack_id = message.ack_id.clone();
                let message_id = message.message.id.clone();
                match handler.handle(message).await {
                    Ok(()) => acks.push(ack_id),
                    Err(e) => {
                        debug!(subscription = %self.subscription, message_id = %message_id, "Handler rejected message: {:#}", e);
                        nacks.push(ack_id);
                    }
                }
            }

            if let Err(e) = self.client.acknowledge(&self.subscription, &acks).await {
                warn!(subscription = %self.subscription, "Acknowledge failed: {}", e);
            } else {
                stats.acked += acks.len() as u64;
            }
            if let Err(e) = self.client.modify_ack_deadline(&self.subscription, &nacks, 0).await {
                warn!(subscription = %self.subscription, "Nack failed: {}", e);
            } else {
                stats.nacked += nacks.len() as u64;
            }
        }

        info!(
            subscription = %self.subscription,
            acked = stats.acked,
            nacked = stats.nacked,
            "Subscriber stopped"
        );
        Ok(stats)
    }

    /// Run on a background task.
    pub fn spawn<H: MessageHandler>(self, handler: H) -> SubscriberHandle {
        let shutdown = ShutdownSignal::new();
        let rx = shutdown.subscribe();
        let task = tokio::spawn(self.run(handler, rx));
        SubscriberHandle { shutdown, task }
    }
}

/// A subscriber running on a background task.
pub struct SubscriberHandle {
    shutdown: ShutdownSignal,
    task: JoinHandle<Result<SubscriberStats>>,
}

impl SubscriberHandle {
    /// Stop after the current batch and return the counts.
    pub async fn stop(self) -> Result<SubscriberStats> {
        self.shutdown.shutdown();
        self.task
            .await
            .map_err(|e| Error::Internal(format!("subscriber task failed: {}", e)))?
    }
}
