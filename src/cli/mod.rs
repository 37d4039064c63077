//! Command-line interface for the `pubsub-testkit` binary.
/// Command execution handlers
pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command-line interface for pubsub-testkit
#[derive(Parser)]
#[command(name = "pubsub-testkit")]
#[command(author, version, about = "Local Pub/Sub emulator and test harness", long_about = None)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the embedded emulator until interrupted
    Start {
        /// REST port
        #[arg(long, env = "PUBSUB_TESTKIT_PORT", default_value = "8085")]
        port: u16,

        /// Bind address (use 0.0.0.0 for all interfaces)
        #[arg(long, env = "PUBSUB_TESTKIT_BIND_ADDRESS", default_value = "127.0.0.1")]
        bind_address: String,

        /// Project id printed in the startup banner
        #[arg(long, env = "PUBSUB_PROJECT_ID")]
        project: Option<String>,

        /// Push delivery workers (default: 2 x CPUs)
        #[arg(long, env = "PUBSUB_TESTKIT_PUSH_WORKERS")]
        push_workers: Option<usize>,

        /// TOML configuration file
        #[arg(long, short, env = "PUBSUB_TESTKIT_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Probe an emulator; exits non-zero if unreachable
    Health {
        /// Emulator base URL or host:port
        #[arg(long, env = "PUBSUB_EMULATOR_HOST", default_value = "http://localhost:8085")]
        endpoint: String,
    },

    /// Print the PUBSUB_EMULATOR_HOST line for `eval`
    Env {
        /// Emulator host:port
        #[arg(long, default_value = "localhost:8085")]
        host: String,
    },
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_flags() {
        let cli = Cli::try_parse_from([
            "pubsub-testkit",
            "start",
            "--port",
            "9085",
            "--push-workers",
            "3",
            "--project",
            "my-project",
        ])
        .unwrap();
        match cli.command {
            Commands::Start {
                port,
                push_workers,
                project,
                bind_address,
                config,
            } => {
                assert_eq!(port, 9085);
                assert_eq!(push_workers, Some(3));
                assert_eq!(project.as_deref(), Some("my-project"));
                assert_eq!(bind_address, "127.0.0.1");
                assert!(config.is_none());
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_parse_env_default_host() {
        let cli = Cli::try_parse_from(["pubsub-testkit", "env"]).unwrap();
        assert!(matches!(cli.command, Commands::Env { host } if host == "localhost:8085"));
    }
}
