//! The Cloud SDK Pub/Sub emulator in a disposable Docker container.

use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tracing::{info, warn};

use crate::config::TestkitConfig;
use crate::{Error, Result};

/// Port the emulator listens on inside the container.
pub const EMULATOR_PORT: u16 = 8085;

/// Log line the emulator prints once it accepts requests.
const READY_MESSAGE: &str = "Server started";

/// A running emulator container. Removed on [`stop`](Self::stop) or drop.
pub struct ContainerEmulator {
    container: ContainerAsync<GenericImage>,
    host: String,
    image: String,
}

impl ContainerEmulator {
    /// Start `image:tag` and wait for the emulator's ready line.
    ///
    /// The caller bounds this with the startup deadline.
    pub async fn start(config: &TestkitConfig) -> Result<Self> {
        let image = config.emulator.image_ref();
        info!("Starting Pub/Sub emulator container {}", image);

        let startup_failed = |reason: String| Error::EmulatorStartup {
            target: image.clone(),
            reason,
        };

        let container = GenericImage::new(config.emulator.image.as_str(), config.emulator.tag.as_str())
            .with_exposed_port(EMULATOR_PORT.tcp())
            .with_wait_for(WaitFor::message_on_stderr(READY_MESSAGE))
            .with_cmd(emulator_command(&config.pubsub.project_id))
            .with_startup_timeout(config.emulator.startup_timeout())
            .start()
            .await
            .map_err(|e| startup_failed(e.to_string()))?;

        let port = container
            .get_host_port_ipv4(EMULATOR_PORT.tcp())
            .await
            .map_err(|e| startup_failed(format!("port {} not mapped: {}", EMULATOR_PORT, e)))?;
        let host = container
            .get_host()
            .await
            .map_err(|e| startup_failed(format!("cannot resolve container host: {}", e)))?;

        let host = format!("{}:{}", host, port);
        info!("Pub/Sub emulator container {} ready on {}", image, host);
        Ok(Self {
            container,
            host,
            image,
        })
    }

    /// `host:port` of the mapped emulator port.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Container id.
    pub fn id(&self) -> &str {
        self.container.id()
    }

    /// Stop and remove the container.
    pub async fn stop(self) {
        let id = self.container.id().to_string();
        if let Err(e) = self.container.rm().await {
            warn!("Failed to remove emulator container {} ({}): {}", id, self.image, e);
        } else {
            info!("Removed emulator container {}", id);
        }
    }
}

/// `gcloud` arguments starting the emulator on all interfaces.
fn emulator_command(project: &str) -> Vec<String> {
    vec![
        "gcloud".to_string(),
        "beta".to_string(),
        "emulators".to_string(),
        "pubsub".to_string(),
        "start".to_string(),
        format!("--host-port=0.0.0.0:{}", EMULATOR_PORT),
        format!("--project={}", project),
    ]
}
