mod assets;
mod commands;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.command.quiet() { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Command::Publish(args) => commands::publish(args).await,
        Command::TestTarget(args) => commands::test_target(args).await,
        Command::Collect(args) => commands::collect(args),
    }
}
