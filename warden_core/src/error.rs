//! Error types for the capability substrate.
//!
//! Errors that can travel back to a caller inside a correlated Tier 2 response
//! are `Clone` and serializable. Lifecycle errors (configuration, bootstrap)
//! are kept apart because they wrap I/O and parse failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelState;
use crate::id::{CapabilityId, ChannelId, CorrelationId, ProcessId};
use crate::kernel::KernelPhase;
use crate::types::{ResourceKind, Tier};

pub type Result<T> = std::result::Result<T, Error>;

/// Root error type for capability, channel and dispatch operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Error {
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
}

impl Error {
    /// Backpressure and deadline failures a caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Channel(ChannelError::QueueFull(_)) | Error::Dispatch(DispatchError::Timeout(_))
        )
    }

    /// Failures that terminate the offending process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Dispatch(DispatchError::ProtocolViolation(_)))
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self, Error::Capability(CapabilityError::Revoked(_)))
    }
}

/// Errors related to capability minting, delegation and checks.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CapabilityError {
    #[error("Capability not found: {0}")]
    NotFound(CapabilityId),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capability expired: {0}")]
    Expired(CapabilityId),

    #[error("Capability revoked: {0}")]
    Revoked(CapabilityId),

    #[error("Invalid delegation: {0}")]
    InvalidDelegation(String),

    #[error("Invalid permissions: {0}")]
    InvalidPermissions(String),

    #[error("Unsupported tier {tier}: {reason}")]
    UnsupportedTier { tier: Tier, reason: String },
}

/// Errors related to channel lifecycle and queueing.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ChannelError {
    #[error("Channel not found: {0}")]
    NotFound(ChannelId),

    #[error("Channel closed: {0}")]
    Closed(ChannelId),

    #[error("Channel queue is full: {0}")]
    QueueFull(ChannelId),

    #[error("Channel {channel} is in state {state:?}")]
    InvalidState {
        channel: ChannelId,
        state: ChannelState,
    },

    #[error("Invalid channel capacity: {0}")]
    InvalidCapacity(usize),

    #[error("Correlation id already in use: {0}")]
    DuplicateCorrelation(CorrelationId),

    #[error("Unknown correlation id: {0}")]
    UnknownCorrelation(CorrelationId),

    #[error("Channel {channel} is a {tier} channel")]
    WrongTier { channel: ChannelId, tier: Tier },
}

/// Errors raised by the tiered dispatcher itself.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DispatchError {
    #[error("No response observed within {0}ms")]
    Timeout(u64),

    #[error("Request {0} was cancelled")]
    Cancelled(CorrelationId),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Process terminated: {0}")]
    ProcessTerminated(ProcessId),

    #[error("Kernel is not running (phase {0:?})")]
    NotRunning(KernelPhase),

    #[error("No service provider for {0}")]
    NoProvider(ResourceKind),
}

/// Errors reported by service providers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ServiceError {
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Operation failed: {0}")]
    Failed(String),
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that can occur while bringing the kernel up.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Boot grant for {owner} failed: {source}")]
    Grant {
        owner: ProcessId,
        #[source]
        source: Error,
    },

    #[error("Kernel is in phase {0:?}")]
    WrongPhase(KernelPhase),
}
