//! Configuration for the Warden kernel.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::id::ProcessId;
use crate::types::{Permissions, ResourceKind};

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub channels: ChannelConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub emergency: EmergencyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub boot: BootConfig,
}

/// Channel sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Capacity used when a caller does not ask for one.
    #[serde(default = "default_capacity")]
    pub default_capacity: usize,

    /// Largest capacity a channel may be created with.
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
}

fn default_capacity() -> usize {
    16
}

fn default_max_capacity() -> usize {
    1024
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            default_capacity: default_capacity(),
            max_capacity: default_max_capacity(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How long an async client waits for a correlated response.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

fn default_response_timeout_ms() -> u64 {
    5000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Interval of the background expiry sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Audit entries kept per capability.
    #[serde(default = "default_audit_max_entries")]
    pub audit_max_entries: usize,

    /// Capabilities the audit log tracks before dropping the oldest.
    #[serde(default = "default_audit_max_capabilities")]
    pub audit_max_capabilities: usize,
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_audit_max_entries() -> usize {
    1000
}

fn default_audit_max_capabilities() -> usize {
    crate::check::audit::DEFAULT_MAX_CAPABILITIES
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            audit_max_entries: default_audit_max_entries(),
            audit_max_capabilities: default_audit_max_capabilities(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyConfig {
    /// Keep the emergency trap available after boot.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<LogLevel, ConfigError> {
        self.level.parse()
    }
}

/// Log verbosity accepted in `logging.level`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(ConfigError::Invalid(format!("unknown log level '{}'", other))),
        }
    }
}

/// Capabilities minted for processes before the kernel starts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    #[serde(default)]
    pub grants: Vec<BootGrant>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootGrant {
    pub owner: u32,
    pub kind: String,
    pub descriptor: String,
    pub permissions: Vec<String>,
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

impl BootGrant {
    pub fn owner(&self) -> ProcessId {
        ProcessId(self.owner)
    }

    pub fn kind(&self) -> Result<ResourceKind, ConfigError> {
        self.kind.parse().map_err(ConfigError::Invalid)
    }

    pub fn permissions(&self) -> Result<Permissions, ConfigError> {
        Permissions::from_names(&self.permissions).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn ttl(&self) -> Option<chrono::Duration> {
        self.ttl_secs.map(chrono::Duration::seconds)
    }
}

impl WardenConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: WardenConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let channels = &self.channels;
        if channels.default_capacity == 0 || channels.max_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel capacities must be positive".to_string(),
            ));
        }
        if channels.default_capacity > channels.max_capacity {
            return Err(ConfigError::Invalid(format!(
                "default_capacity {} exceeds max_capacity {}",
                channels.default_capacity, channels.max_capacity
            )));
        }
        if self.registry.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_ms must be positive".to_string(),
            ));
        }
        self.logging.level()?;
        for grant in &self.boot.grants {
            grant.kind()?;
            grant.permissions()?;
        }
        Ok(())
    }
}
