//! Channel lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a channel reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// Closed by its owner after draining.
    Normal,
    /// The bound capability was revoked or expired.
    Revoked,
}

/// Lifecycle of a channel.
///
/// `Created -> Open -> Draining -> Closed`, with a forced jump to
/// `Closed(Revoked)` from any state when the bound capability dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Created,
    Open,
    Draining,
    Closed(CloseReason),
}

impl ChannelState {
    pub fn is_closed(self) -> bool {
        matches!(self, ChannelState::Closed(_))
    }

    /// Whether queued work may still be dispatched.
    pub fn is_serviceable(self) -> bool {
        matches!(self, ChannelState::Open | ChannelState::Draining)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Created => write!(f, "created"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Draining => write!(f, "draining"),
            ChannelState::Closed(CloseReason::Normal) => write!(f, "closed"),
            ChannelState::Closed(CloseReason::Revoked) => write!(f, "closed(revoked)"),
        }
    }
}
