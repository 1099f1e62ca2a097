//! Warden CLI - drive the capability channel substrate from the command line.

mod commands;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use error::CliError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warden_core::config::LogLevel;
use warden_core::WardenConfig;

#[derive(Debug, Parser)]
#[command(name = "warden")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Capability channel substrate", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk through every dispatch tier, delegation, revocation and shutdown
    Demo,

    /// Revoke a capability while requests are queued on its channel
    RevokeRace {
        /// Number of requests to queue before revoking
        #[arg(long, default_value_t = 8)]
        requests: usize,
    },

    /// Boot a kernel from a configuration file and run until Ctrl-C
    Boot {
        /// Path to the TOML configuration
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Shut down right after boot instead of waiting for Ctrl-C
        #[arg(long)]
        once: bool,
    },
}

fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(command: Commands, config: WardenConfig) -> Result<(), CliError> {
    match command {
        Commands::Demo => commands::demo().await,
        Commands::RevokeRace { requests } => {
            let summary = commands::revoke_race(requests).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Boot { once, .. } => {
            let report = commands::boot(config, once).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = match &cli.command {
        Commands::Boot { config, .. } => WardenConfig::from_file(config).map_err(CliError::from),
        _ => Ok(WardenConfig::default()),
    };
    let level = loaded
        .as_ref()
        .ok()
        .and_then(|c| c.logging.level().ok())
        .unwrap_or(LogLevel::Info);
    init_logging(level);

    let result = match loaded {
        Ok(config) => {
            info!(command = ?cli.command, "Starting");
            run(cli.command, config).await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
