//! A disposable push endpoint for tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::push::{push_route, PushEnvelope, PushHandler, PushRejection};
use crate::server::{shutdown_receiver, ShutdownSignal};
use crate::{Error, Result};

/// Path [`PushEndpoint::start`] serves on.
pub const DEFAULT_PUSH_PATH: &str = "/push";

const STOP_GRACE: Duration = Duration::from_secs(5);

/// HTTP server on an ephemeral local port serving one push handler.
///
/// Stopped by [`stop`](Self::stop) or on drop.
pub struct PushEndpoint {
    addr: SocketAddr,
    path: String,
    shutdown: ShutdownSignal,
    task: Option<JoinHandle<()>>,
}

impl PushEndpoint {
    /// Serve `handler` at `http://127.0.0.1:<ephemeral>/push`.
    pub async fn start<H: PushHandler>(handler: H) -> Result<Self> {
        Self::start_at("127.0.0.1:0", DEFAULT_PUSH_PATH, handler).await
    }

    /// Serve `handler` at `path` on `bind_address`.
    pub async fn start_at<H: PushHandler>(bind_address: &str, path: &str, handler: H) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let addr = listener.local_addr()?;
        let app = push_route(path, handler);

        let shutdown = ShutdownSignal::new();
        let rx = shutdown.subscribe();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_receiver(rx))
                .await
            {
                error!("Push endpoint on {} failed: {}", addr, e);
            }
        });

        info!("Push endpoint listening on http://{}{}", addr, path);
        Ok(Self {
            addr,
            path: path.to_string(),
            shutdown,
            task: Some(task),
        })
    }

    /// URL to use as a subscription's push endpoint.
    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, self.path)
    }

    /// Bound socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests and wait for the server task.
    pub async fn stop(mut self) {
        self.shutdown.shutdown();
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
                warn!("Push endpoint on {} did not stop in time, aborting", self.addr);
                abort.abort();
            }
        }
        debug!("Push endpoint on {} stopped", self.addr);
    }
}

impl Drop for PushEndpoint {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

struct Recording {
    accepted: Mutex<Vec<PushEnvelope>>,
    calls: AtomicUsize,
    fail_first: usize,
    notify: Notify,
}

/// [`PushHandler`] that records every accepted envelope.
///
/// Clones share the same recording, so keep one and hand a clone to the
/// endpoint.
#[derive(Clone)]
pub struct RecordingHandler {
    inner: Arc<Recording>,
}

impl RecordingHandler {
    /// Accept everything.
    pub fn new() -> Self {
        Self::failing_first(0)
    }

    /// Reject the first `n` deliveries with 503, then accept.
    pub fn failing_first(n: usize) -> Self {
        Self {
            inner: Arc::new(Recording {
                accepted: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                fail_first: n,
                notify: Notify::new(),
            }),
        }
    }

    /// Envelopes accepted so far, in arrival order.
    pub async fn received(&self) -> Vec<PushEnvelope> {
        self.inner.accepted.lock().await.clone()
    }

    /// Deliveries seen so far, rejected ones included.
    pub fn attempts(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` envelopes were accepted.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Result<Vec<PushEnvelope>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.notify.notified();
            {
                let accepted = self.inner.accepted.lock().await;
                if accepted.len() >= n {
                    return Ok(accepted.clone());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout(timeout));
            }
        }
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushHandler for RecordingHandler {
    async fn handle(&self, envelope: PushEnvelope) -> std::result::Result<(), PushRejection> {
        let call = self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.inner.fail_first {
            return Err(PushRejection::new(format!(
                "rejecting delivery {} of {}",
                call + 1,
                self.inner.fail_first
            )));
        }

        self.inner.accepted.lock().await.push(envelope);
        self.inner.notify.notify_waiters();
        Ok(())
    }
}
