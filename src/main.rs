//! hostbridge - Host-resident broker bridge for machine control
//!
//! Connects this machine to an MQTT-style broker through pluggable addons
//! and keeps one helper agent process alive per interactive session.

use anyhow::Result;
use clap::{Parser, Subcommand};
use hostbridge::{BridgeConfig, BridgeService};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hostbridge")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Host-resident broker bridge for machine control")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "HOSTBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge service
    Run,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hostbridge={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };

    match cli.command {
        Commands::Run => run_service(config).await?,
        Commands::Config { default } => {
            if default {
                print!("{}", BridgeConfig::default_yaml());
            } else {
                print!(
                    "{}",
                    serde_yaml::to_string(&config).unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}

async fn run_service(config: BridgeConfig) -> Result<()> {
    let service = BridgeService::new(config);

    service.start().await?;
    tracing::info!("hostbridge is running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    service.stop().await?;

    Ok(())
}
