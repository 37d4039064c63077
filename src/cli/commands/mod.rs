// Commands module
/// Start command implementation
pub mod start;

use anyhow::Context;

use crate::cli::Commands;
use crate::config::EMULATOR_HOST_ENV;
use crate::emulator::probe;

/// Execute a CLI command
pub async fn execute_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Start {
            port,
            bind_address,
            project,
            push_workers,
            config,
        } => {
            start::execute(start::StartOptions {
                port,
                bind_address,
                project,
                push_workers,
                config,
            })
            .await
        }
        Commands::Health { endpoint } => execute_health(endpoint).await,
        Commands::Env { host } => {
            println!("{}", env_line(&host));
            Ok(())
        }
    }
}

async fn execute_health(endpoint: String) -> anyhow::Result<()> {
    let url = endpoint_url(&endpoint);
    probe(&url)
        .await
        .with_context(|| format!("Pub/Sub emulator at {} is not reachable", url))?;
    println!("Pub/Sub emulator at {} is healthy", url);
    Ok(())
}

/// `export PUBSUB_EMULATOR_HOST=host`
fn env_line(host: &str) -> String {
    format!("export {}={}", EMULATOR_HOST_ENV, host)
}

/// Accept `host:port` as well as a full URL.
fn endpoint_url(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", endpoint.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_line() {
        assert_eq!(env_line("localhost:8085"), "export PUBSUB_EMULATOR_HOST=localhost:8085");
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("localhost:8085"), "http://localhost:8085");
        assert_eq!(endpoint_url("http://h:1/"), "http://h:1");
    }

    #[tokio::test]
    async fn test_health_fails_on_closed_port() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = execute_health(format!("127.0.0.1:{}", port)).await;
        assert!(result.is_err());
    }
}
