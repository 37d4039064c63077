use pubsub_testkit::cli::{commands, Cli, Commands};
use pubsub_testkit::config::LoggingConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // `start` initialises logging from its resolved configuration
    if !matches!(cli.command, Commands::Start { .. }) {
        pubsub_testkit::logging::init(&LoggingConfig::default());
    }

    // Execute the command
    commands::execute_command(cli.command).await?;

    Ok(())
}
