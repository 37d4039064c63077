//! In-process emulator: the REST router over the in-memory backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::TestkitConfig;
use crate::core::deadline::DeadlineSweeper;
use crate::pubsub::publisher::PublisherService;
use crate::pubsub::push_queue::DeliveryQueue;
use crate::pubsub::push_worker::PushWorkerPool;
use crate::pubsub::rest::{create_router, serve, RestState};
use crate::server::ShutdownSignal;
use crate::storage::memory::{InMemoryBackend, InMemoryConfig};
use crate::storage::StorageBackend;
use crate::{Error, Result};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// A running embedded emulator.
pub struct EmbeddedEmulator {
    addr: SocketAddr,
    backend: Arc<dyn StorageBackend>,
    shutdown: ShutdownSignal,
    server: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    workers: Option<PushWorkerPool>,
}

impl EmbeddedEmulator {
    /// Bind, then start the REST server, push workers and deadline sweeper.
    pub async fn start(config: &TestkitConfig) -> Result<Self> {
        let bind = format!("{}:{}", config.emulator.bind_address, config.emulator.port);
        let listener = TcpListener::bind(&bind).await.map_err(|e| Error::EmulatorStartup {
            target: bind.clone(),
            reason: format!("cannot bind: {}", e),
        })?;
        let addr = listener.local_addr()?;

        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::with_config(InMemoryConfig {
            max_messages: config.pubsub.max_messages,
            eviction_policy: config.pubsub.eviction_policy,
        }));

        let publisher = PublisherService::new(backend.clone(), DeliveryQueue::new());
        let workers = PushWorkerPool::new(publisher.clone(), &config.push)?;
        let router = create_router(
            RestState::new(publisher, config.pubsub.default_ack_deadline_seconds),
            config.metrics.enabled,
        );

        let shutdown = ShutdownSignal::new();

        let server_rx = shutdown.subscribe();
        let server = tokio::spawn(async move {
            if let Err(e) = serve(listener, router, server_rx).await {
                error!("Embedded emulator server failed: {}", e);
            }
        });

        let sweeper = DeadlineSweeper::with_interval(
            backend.clone(),
            Duration::from_secs(config.emulator.deadline_sweep_interval_secs.max(1)),
        );
        let sweeper = tokio::spawn(sweeper.run(shutdown.subscribe()));

        info!("Embedded Pub/Sub emulator started on {}", addr);
        Ok(Self {
            addr,
            backend,
            shutdown,
            server: Some(server),
            sweeper: Some(sweeper),
            workers: Some(workers),
        })
    }

    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The backing store, for assertions that bypass HTTP.
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    /// Stop the server, sweeper and push workers.
    pub async fn stop(mut self) {
        self.shutdown.shutdown();

        if let Some(server) = self.server.take() {
            let abort = server.abort_handle();
            if tokio::time::timeout(STOP_GRACE, server).await.is_err() {
                warn!("Embedded emulator on {} did not stop in time, aborting", self.addr);
                abort.abort();
            }
        }
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.await;
        }
        if let Some(workers) = self.workers.take() {
            workers.shutdown().await;
        }

        info!("Embedded Pub/Sub emulator on {} stopped", self.addr);
    }
}

impl Drop for EmbeddedEmulator {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(workers) = &self.workers {
            workers.queue().close();
        }
    }
}
