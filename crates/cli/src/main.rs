//! `dialtoned`: runs the telephony API and the line reconciler

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use dialtone_infra_common::{setup_logging, LoggingConfig};
use dialtone_telephony_core::{TelephonyConfig, TelephonyServerBuilder};

#[derive(Parser, Debug)]
#[command(name = "dialtoned")]
#[command(about = "Phone line lifecycle and usage metering service")]
struct Args {
    /// Configuration file (TOML); `DIALTONE__*` variables override it
    #[arg(short, long, env = "DIALTONE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the API server (default)
    Serve,
    /// Validate the configuration and exit
    CheckConfig,
    /// Settle lines stuck connecting or disconnecting, then exit
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TelephonyConfig::load(args.config.as_deref()).context("loading configuration")?;

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let logging = LoggingConfig::from_level_str(level, "dialtoned")?.with_json(config.logging.json);
    setup_logging(&logging)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let mut server = TelephonyServerBuilder::new().with_config(config).build().await?;
            server.run().await?;
        }
        Command::CheckConfig => {
            info!(
                bind = %config.api_bind_address,
                database = %config.database_url,
                "Configuration is valid"
            );
        }
        Command::Reconcile => {
            let service = dialtone_telephony_core::init(config).await?;
            let settled = service.lifecycle.reconcile_pending().await?;
            info!(settled, "Reconciliation finished");
        }
    }
    Ok(())
}
