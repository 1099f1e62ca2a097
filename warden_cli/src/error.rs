//! Error types for the Warden CLI.

use thiserror::Error;
use warden_core::error::ConfigError;

/// Errors that can occur in the CLI
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Kernel error: {0}")]
    Kernel(#[from] warden_core::Error),

    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] warden_core::BootstrapError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Demo error: {0}")]
    Demo(String),
}
