//! Ack deadline sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info};

use crate::storage::StorageBackend;

/// Background task returning messages with expired ack deadlines to their backlog.
///
/// `pull` also requeues lazily; the sweeper keeps stats accurate between pulls.
pub struct DeadlineSweeper {
    backend: Arc<dyn StorageBackend>,
    check_interval: Duration,
}

impl DeadlineSweeper {
    /// Create a sweeper with a custom check interval.
    pub fn with_interval(backend: Arc<dyn StorageBackend>, check_interval: Duration) -> Self {
        Self {
            backend,
            check_interval,
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.check_interval.as_millis() as u64,
            "Starting ack deadline sweeper"
        );

        let mut interval = time::interval(self.check_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.backend.requeue_expired().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "Requeued messages with expired ack deadlines"),
                        Err(e) => error!(error = %e, "Error requeueing expired messages"),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        debug!("Ack deadline sweeper stopped");
    }
}
