//! CLI entry point for the harvester tool.

use anyhow::Result;
use clap::Parser;
use harvester_core::config::AppConfig;
use harvester_core::service::HarvestService;
use tracing::{debug, info};

mod cli;
mod commands;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?cli, "CLI arguments parsed");

    let (mut config, config_path) = AppConfig::load_or_default(cli.config.as_deref())?;
    if let Some(path) = &config_path {
        debug!(path = %path.display(), "configuration loaded");
    }
    if let Some(database) = cli.database.clone() {
        config.database_path = database;
    }

    let service = HarvestService::from_config(&config).await?;
    info!(database = %config.database_path.display(), "harvester ready");

    match &cli.command {
        Command::Source(command) => commands::run_source_command(&service, command).await,
        Command::Harvest { source_id } => commands::run_harvest_command(&service, *source_id).await,
        Command::Logs(args) => commands::run_logs_command(&service, args).await,
        Command::Serve(args) => commands::run_serve_command(&service, args).await,
        Command::Search(args) => commands::run_search_command(&service, args).await,
        Command::Providers { institution } => {
            commands::run_providers_command(&service, institution.as_deref()).await
        }
    }
}
