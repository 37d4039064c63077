//! Emulator lifecycle: start, readiness, endpoint, teardown.
//!
//! Three backends, picked by [`EmulatorBackend`]:
//!
//! - **Embedded**: the in-process REST emulator on an ephemeral port
//! - **Container**: the Cloud SDK emulator image via `testcontainers`
//! - **External**: an emulator someone else started (`PUBSUB_EMULATOR_HOST`)
//!
//! Every start is bounded by `emulator.startup_timeout_secs`. A backend that
//! does not come up in time fails with [`Error::StartupTimeout`] instead of
//! hanging the test run.

pub mod container;
pub mod embedded;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{EmulatorBackend, TestkitConfig};
use crate::storage::StorageBackend;
use crate::{Error, Result};

pub use container::ContainerEmulator;
pub use embedded::EmbeddedEmulator;

const PROBE_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const PROBE_MAX_BACKOFF: Duration = Duration::from_secs(1);
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// A running Pub/Sub emulator.
pub enum Emulator {
    /// In-process emulator.
    Embedded(EmbeddedEmulator),
    /// Docker container.
    Container(ContainerEmulator),
    /// Emulator managed outside this process.
    External {
        /// `host:port`
        host: String,
    },
}

impl Emulator {
    /// Start the configured backend and wait until it answers requests.
    pub async fn start(config: &TestkitConfig) -> Result<Self> {
        config.validate()?;
        let timeout = config.emulator.startup_timeout();
        let started = Instant::now();

        let emulator = match config.emulator.backend {
            EmulatorBackend::Embedded => {
                let target = format!(
                    "embedded emulator on {}:{}",
                    config.emulator.bind_address, config.emulator.port
                );
                let embedded = with_startup_deadline(&target, timeout, EmbeddedEmulator::start(config)).await?;
                Emulator::Embedded(embedded)
            }
            EmulatorBackend::Container => {
                let target = config.emulator.image_ref();
                let container = with_startup_deadline(&target, timeout, ContainerEmulator::start(config)).await?;
                Emulator::Container(container)
            }
            EmulatorBackend::External => {
                let host = config
                    .emulator
                    .external_host
                    .as_deref()
                    .map(normalize_host)
                    .ok_or_else(|| Error::Config("external backend requires an emulator host".to_string()))?;
                Emulator::External { host }
            }
        };

        let remaining = timeout.saturating_sub(started.elapsed());
        wait_until_ready(&emulator.endpoint(), remaining).await?;

        info!(
            backend = ?config.emulator.backend,
            endpoint = %emulator.endpoint(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pub/Sub emulator ready"
        );
        Ok(emulator)
    }

    /// `host:port`, the `PUBSUB_EMULATOR_HOST` form.
    pub fn host(&self) -> String {
        match self {
            Emulator::Embedded(embedded) => embedded.addr().to_string(),
            Emulator::Container(container) => container.host().to_string(),
            Emulator::External { host } => host.clone(),
        }
    }

    /// Base URL, e.g. `http://127.0.0.1:43121`.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.host())
    }

    /// Which backend is running.
    pub fn backend_kind(&self) -> EmulatorBackend {
        match self {
            Emulator::Embedded(_) => EmulatorBackend::Embedded,
            Emulator::Container(_) => EmulatorBackend::Container,
            Emulator::External { .. } => EmulatorBackend::External,
        }
    }

    /// The embedded emulator's store, if this is one.
    pub fn embedded_backend(&self) -> Option<Arc<dyn StorageBackend>> {
        match self {
            Emulator::Embedded(embedded) => Some(embedded.backend()),
            _ => None,
        }
    }

    /// Shut the emulator down. External emulators are left running.
    pub async fn stop(self) {
        match self {
            Emulator::Embedded(embedded) => embedded.stop().await,
            Emulator::Container(container) => container.stop().await,
            Emulator::External { host } => debug!("Leaving external emulator {} running", host),
        }
    }
}

/// Accept `host:port` as well as `http://host:port/`.
fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_string()
}

/// Run `fut`, failing with [`Error::StartupTimeout`] if it takes longer than `timeout`.
pub async fn with_startup_deadline<T, F>(target: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::StartupTimeout {
            target: target.to_string(),
            timeout,
        }),
    }
}

/// Probe `GET {endpoint}/` with backoff until it answers 2xx.
///
/// Tries at least once; gives up with [`Error::StartupTimeout`] after `timeout`.
pub async fn wait_until_ready(endpoint: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_REQUEST_TIMEOUT)
        .build()?;
    let url = format!("{}/", endpoint.trim_end_matches('/'));
    let deadline = Instant::now() + timeout;
    let mut backoff = PROBE_INITIAL_BACKOFF;

    loop {
        let last_error = match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => format!("status {}", response.status()),
            Err(e) => e.to_string(),
        };

        let now = Instant::now();
        if now >= deadline {
            warn!(endpoint = %endpoint, "Emulator not ready: {}", last_error);
            return Err(Error::StartupTimeout {
                target: endpoint.to_string(),
                timeout,
            });
        }
        debug!(endpoint = %endpoint, "Emulator not ready yet: {}", last_error);

        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(PROBE_MAX_BACKOFF);
    }
}

/// Probe once; used by `pubsub-testkit health`.
pub async fn probe(endpoint: &str) -> Result<()> {
    wait_until_ready(endpoint, Duration::ZERO).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("localhost:8085"), "localhost:8085");
        assert_eq!(normalize_host("http://localhost:8085/"), "localhost:8085");
        assert_eq!(normalize_host(" https://h:1 "), "h:1");
    }

    #[tokio::test]
    async fn test_startup_deadline_aborts_hanging_start() {
        let result: Result<()> = with_startup_deadline(
            "gcr.io/example/never-ready:latest",
            Duration::from_millis(50),
            std::future::pending(),
        )
        .await;

        match result {
            Err(Error::StartupTimeout { target, timeout }) => {
                assert_eq!(target, "gcr.io/example/never-ready:latest");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("expected StartupTimeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_startup_deadline_passes_through_failure() {
        let result: Result<()> = with_startup_deadline("image", Duration::from_secs(5), async {
            Err(Error::EmulatorStartup {
                target: "image".to_string(),
                reason: "pull access denied".to_string(),
            })
        })
        .await;
        assert!(matches!(result, Err(Error::EmulatorStartup { .. })));
    }

    #[tokio::test]
    async fn test_wait_until_ready_gives_up_on_closed_port() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let started = Instant::now();
        let result = wait_until_ready(&format!("http://127.0.0.1:{}", port), Duration::from_millis(200)).await;

        assert!(matches!(result, Err(Error::StartupTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_embedded_start_and_stop() {
        let emulator = Emulator::start(&TestkitConfig::default()).await.unwrap();
        assert_eq!(emulator.backend_kind(), EmulatorBackend::Embedded);
        assert!(emulator.endpoint().starts_with("http://127.0.0.1:"));
        assert!(emulator.embedded_backend().is_some());

        let endpoint = emulator.endpoint();
        probe(&endpoint).await.unwrap();
        emulator.stop().await;
        assert!(probe(&endpoint).await.is_err());
    }

    #[tokio::test]
    async fn test_external_backend_requires_running_emulator() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = TestkitConfig::default();
        config.emulator.backend = EmulatorBackend::External;
        config.emulator.external_host = Some(format!("127.0.0.1:{}", port));
        config.emulator.startup_timeout_secs = 1;

        let result = Emulator::start(&config).await;
        assert!(matches!(result, Err(Error::StartupTimeout { .. })));
    }
}
