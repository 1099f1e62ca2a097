//! Invocation tiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::ProcessId;

/// Performance/trust class of an invocation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Tier 1: synchronous, single-slot, never suspends.
    Direct,
    /// Tier 2: queued with backpressure and correlated responses.
    Async,
    /// Tier 3: bootstrap-only trap path. Never a capability or channel tier.
    Emergency,
}

impl Tier {
    /// Tier given to a root capability when none is requested.
    pub fn default_for(owner: ProcessId) -> Tier {
        if owner.is_kernel() {
            Tier::Direct
        } else {
            Tier::Async
        }
    }

    /// Whether capabilities and channels may carry this tier.
    pub fn is_channel_tier(self) -> bool {
        !matches!(self, Tier::Emergency)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Direct => write!(f, "direct"),
            Tier::Async => write!(f, "async"),
            Tier::Emergency => write!(f, "emergency"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tier() {
        assert_eq!(Tier::default_for(ProcessId::KERNEL), Tier::Direct);
        assert_eq!(Tier::default_for(ProcessId(3)), Tier::Async);
        assert!(!Tier::Emergency.is_channel_tier());
    }
}
