//! Configuration system for pubsub-testkit.
//!
//! Precedence, lowest to highest: [`TestkitConfig::default`], a TOML file
//! ([`TestkitConfig::from_file`]), environment variables
//! ([`TestkitConfig::apply_env`]) and finally CLI flags.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::validation::{validate_ack_deadline, validate_project_id};
use crate::types::RetryPolicy;
use crate::{Error, Result};

/// Environment variable naming an already-running emulator (`host:port`).
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";
/// Environment variable overriding the project ID.
pub const PROJECT_ID_ENV: &str = "PUBSUB_PROJECT_ID";
/// Environment variable selecting the emulator backend.
pub const BACKEND_ENV: &str = "PUBSUB_TESTKIT_BACKEND";
/// Environment variable overriding the emulator container image.
pub const IMAGE_ENV: &str = "PUBSUB_TESTKIT_IMAGE";
/// Environment variable overriding the startup timeout, in seconds.
pub const STARTUP_TIMEOUT_ENV: &str = "PUBSUB_TESTKIT_STARTUP_TIMEOUT_SECS";

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestkitConfig {
    /// Emulator configuration.
    pub emulator: EmulatorConfig,
    /// Pub/Sub configuration.
    pub pubsub: PubsubConfig,
    /// Push delivery configuration.
    pub push: PushDeliveryConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

/// Which emulator a harness runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmulatorBackend {
    /// In-process emulator on an ephemeral port.
    #[default]
    Embedded,
    /// Cloud SDK emulator in a disposable container.
    Container,
    /// Already-running emulator named by `external_host`.
    External,
}

impl std::str::FromStr for EmulatorBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "embedded" | "memory" => Ok(Self::Embedded),
            "container" | "docker" => Ok(Self::Container),
            "external" => Ok(Self::External),
            other => Err(Error::Config(format!("Unknown emulator backend: {}", other))),
        }
    }
}

/// Emulator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Backend kind.
    pub backend: EmulatorBackend,
    /// Bind address for the embedded emulator.
    pub bind_address: String,
    /// Port for the embedded emulator (0 = ephemeral).
    pub port: u16,
    /// Container image name.
    pub image: String,
    /// Container image tag.
    pub tag: String,
    /// Seconds to wait for the emulator to become ready.
    pub startup_timeout_secs: u64,
    /// `host:port` of an external emulator.
    pub external_host: Option<String>,
    /// Seconds between ack-deadline sweeps in the embedded emulator.
    pub deadline_sweep_interval_secs: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            backend: EmulatorBackend::Embedded,
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            image: "gcr.io/google.com/cloudsdktool/google-cloud-cli".to_string(),
            tag: "emulators".to_string(),
            startup_timeout_secs: 60,
            external_host: None,
            deadline_sweep_interval_secs: 1,
        }
    }
}

impl EmulatorConfig {
    /// Startup deadline as a [`Duration`].
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Full image reference (`image:tag`).
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Pub/Sub-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubsubConfig {
    /// Project ID used for resources created by the harness.
    pub project_id: String,
    /// Ack deadline for subscriptions created without one.
    pub default_ack_deadline_seconds: u32,
    /// Maximum number of messages held by the embedded emulator.
    pub max_messages: usize,
    /// What to do when `max_messages` is reached.
    pub eviction_policy: EvictionPolicy,
}

/// Policy applied when the embedded emulator is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Drop the oldest undelivered message.
    #[default]
    DropOldest,
    /// Reject the publish.
    RejectNew,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            project_id: "local-project".to_string(),
            default_ack_deadline_seconds: 10,
            max_messages: 100_000,
            eviction_policy: EvictionPolicy::DropOldest,
        }
    }
}

/// Push delivery configuration for the embedded emulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushDeliveryConfig {
    /// Worker count; `None` = `num_cpus * 2`.
    pub workers: Option<usize>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u32,
    /// Retry policy for subscriptions that don't set one.
    pub retry_policy: RetryPolicy,
}

impl Default for PushDeliveryConfig {
    fn default() -> Self {
        Self {
            workers: None,
            request_timeout_secs: 30,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, used when `RUST_LOG` is unset.
    pub level: String,
    /// Log format (text or json).
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log format enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format.
    #[default]
    Text,
    /// JSON format.
    Json,
}

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics` on the embedded emulator.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl TestkitConfig {
    /// Load configuration from a TOML file. Missing sections take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup; `apply_env` uses the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = non_empty(EMULATOR_HOST_ENV) {
            self.emulator.backend = EmulatorBackend::External;
            self.emulator.external_host = Some(host);
        }
        // An explicit backend wins over the mere presence of PUBSUB_EMULATOR_HOST.
        if let Some(backend) = non_empty(BACKEND_ENV) {
            self.emulator.backend = backend.parse()?;
        }
        if let Some(project) = non_empty(PROJECT_ID_ENV) {
            self.pubsub.project_id = project;
        }
        if let Some(image) = non_empty(IMAGE_ENV) {
            match image.rsplit_once(':') {
                Some((name, tag)) if !name.is_empty() && !tag.contains('/') => {
                    self.emulator.image = name.to_string();
                    self.emulator.tag = tag.to_string();
                }
                _ => self.emulator.image = image,
            }
        }
        if let Some(secs) = non_empty(STARTUP_TIMEOUT_ENV) {
            self.emulator.startup_timeout_secs = secs.trim().parse().map_err(|_| {
                Error::Config(format!("{} must be a number of seconds, got {:?}", STARTUP_TIMEOUT_ENV, secs))
            })?;
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validate_project_id(&self.pubsub.project_id)?;
        validate_ack_deadline(i64::from(self.pubsub.default_ack_deadline_seconds), false)?;

        if self.emulator.startup_timeout_secs == 0 {
            return Err(Error::Config("emulator.startup_timeout_secs must be > 0".to_string()));
        }
        if self.emulator.backend == EmulatorBackend::Container && self.emulator.image.trim().is_empty() {
            return Err(Error::Config("emulator.image must not be empty".to_string()));
        }
        if self.emulator.backend == EmulatorBackend::External && self.emulator.external_host.is_none() {
            return Err(Error::Config(format!(
                "external backend requires emulator.external_host or {}",
                EMULATOR_HOST_ENV
            )));
        }
        if self.push.workers == Some(0) {
            return Err(Error::Config("push.workers must be > 0".to_string()));
        }
        if self.pubsub.max_messages == 0 {
            return Err(Error::Config("pubsub.max_messages must be > 0".to_string()));
        }
        let policy = &self.push.retry_policy;
        if policy.min_backoff_seconds > policy.max_backoff_seconds {
            return Err(Error::Config(
                "push.retry_policy.min_backoff_seconds exceeds max_backoff_seconds".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = TestkitConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.emulator.backend, EmulatorBackend::Embedded);
        assert_eq!(config.emulator.port, 0);
        assert_eq!(
            config.emulator.image_ref(),
            "gcr.io/google.com/cloudsdktool/google-cloud-cli:emulators"
        );
    }

    #[test]
    fn test_partial_toml_takes_defaults() {
        let config = TestkitConfig::from_toml(
            r#"
            [pubsub]
            project_id = "orders-test"

            [emulator]
            backend = "container"
            startup_timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.pubsub.project_id, "orders-test");
        assert_eq!(config.pubsub.default_ack_deadline_seconds, 10);
        assert_eq!(config.emulator.backend, EmulatorBackend::Container);
        assert_eq!(config.emulator.startup_timeout(), Duration::from_secs(5));
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"\nformat = \"json\"").unwrap();

        let config = TestkitConfig::from_file(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = TestkitConfig::from_toml("[pubsub\nproject_id = 1").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_emulator_host_selects_external_backend() {
        let mut config = TestkitConfig::default();
        config
            .apply_overrides(lookup(&[
                (EMULATOR_HOST_ENV, "localhost:8681"),
                (PROJECT_ID_ENV, "env-project"),
            ]))
            .unwrap();

        assert_eq!(config.emulator.backend, EmulatorBackend::External);
        assert_eq!(config.emulator.external_host.as_deref(), Some("localhost:8681"));
        assert_eq!(config.pubsub.project_id, "env-project");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_backend_overrides_emulator_host() {
        let mut config = TestkitConfig::default();
        config
            .apply_overrides(lookup(&[
                (EMULATOR_HOST_ENV, "localhost:8681"),
                (BACKEND_ENV, "embedded"),
            ]))
            .unwrap();
        assert_eq!(config.emulator.backend, EmulatorBackend::Embedded);
    }

    #[test]
    fn test_image_override_splits_tag() {
        let mut config = TestkitConfig::default();
        config
            .apply_overrides(lookup(&[(IMAGE_ENV, "localhost:5000/pubsub-emulator:470.0.0")]))
            .unwrap();
        assert_eq!(config.emulator.image, "localhost:5000/pubsub-emulator");
        assert_eq!(config.emulator.tag, "470.0.0");

        let mut config = TestkitConfig::default();
        config
            .apply_overrides(lookup(&[(IMAGE_ENV, "localhost:5000/pubsub-emulator")]))
            .unwrap();
        assert_eq!(config.emulator.image, "localhost:5000/pubsub-emulator");
        assert_eq!(config.emulator.tag, "emulators");
    }

    #[test]
    fn test_bad_overrides_are_rejected() {
        let mut config = TestkitConfig::default();
        assert!(config
            .apply_overrides(lookup(&[(STARTUP_TIMEOUT_ENV, "soon")]))
            .is_err());
        assert!(config
            .apply_overrides(lookup(&[(BACKEND_ENV, "kafka")]))
            .is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = TestkitConfig::default();
        config.pubsub.project_id = "Bad".to_string();
        assert!(config.validate().is_err());

        let mut config = TestkitConfig::default();
        config.emulator.startup_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = TestkitConfig::default();
        config.emulator.backend = EmulatorBackend::External;
        assert!(config.validate().is_err());

        let mut config = TestkitConfig::default();
        config.push.workers = Some(0);
        assert!(config.validate().is_err());

        let mut config = TestkitConfig::default();
        config.pubsub.default_ack_deadline_seconds = 5;
        assert!(config.validate().is_err());
    }
}
