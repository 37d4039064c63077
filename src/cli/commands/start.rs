// Start command implementation
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{EmulatorBackend, TestkitConfig};
use crate::emulator::Emulator;
use crate::server::wait_for_signal;

/// Flags of `pubsub-testkit start`.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// REST port.
    pub port: u16,
    /// Bind address.
    pub bind_address: String,
    /// Project id override.
    pub project: Option<String>,
    /// Push worker override.
    pub push_workers: Option<usize>,
    /// TOML configuration file.
    pub config: Option<PathBuf>,
}

/// Resolve the configuration: file, then environment, then flags.
pub fn resolve_config(options: StartOptions) -> Result<TestkitConfig> {
    let mut config = match &options.config {
        Some(path) => TestkitConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => TestkitConfig::default(),
    };
    config.apply_env().context("Invalid environment override")?;

    // `start` always serves the embedded emulator.
    config.emulator.backend = EmulatorBackend::Embedded;
    config.emulator.external_host = None;
    config.emulator.port = options.port;
    config.emulator.bind_address = options.bind_address;
    if let Some(project) = options.project {
        config.pubsub.project_id = project;
    }
    if options.push_workers.is_some() {
        config.push.workers = options.push_workers;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Execute the start command - runs the embedded emulator until SIGINT/SIGTERM
pub async fn execute(options: StartOptions) -> Result<()> {
    let config = resolve_config(options)?;
    crate::logging::init(&config.logging);

    info!("Starting pubsub-testkit emulator");
    let emulator = Emulator::start(&config)
        .await
        .context("Failed to start embedded emulator")?;

    info!("Project: {}", config.pubsub.project_id);
    info!("REST endpoint: {}", emulator.endpoint());
    info!("export PUBSUB_EMULATOR_HOST={}", emulator.host());

    wait_for_signal().await;

    info!("Shutting down");
    emulator.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn options() -> StartOptions {
        StartOptions {
            port: 0,
            bind_address: "127.0.0.1".to_string(),
            project: None,
            push_workers: None,
            config: None,
        }
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pubsub]\nproject_id = \"file-project\"\n\n[push]\nworkers = 2\n"
        )
        .unwrap();

        let config = resolve_config(StartOptions {
            project: Some("flag-project".to_string()),
            config: Some(file.path().to_path_buf()),
            ..options()
        })
        .unwrap();

        assert_eq!(config.pubsub.project_id, "flag-project");
        assert_eq!(config.push.workers, Some(2));
        assert_eq!(config.emulator.backend, EmulatorBackend::Embedded);
    }

    #[test]
    fn test_rejects_zero_push_workers() {
        let result = resolve_config(StartOptions {
            push_workers: Some(0),
            ..options()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let result = resolve_config(StartOptions {
            config: Some(PathBuf::from("/nonexistent/pubsub-testkit.toml")),
            ..options()
        });
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("Failed to load configuration"));
    }
}
