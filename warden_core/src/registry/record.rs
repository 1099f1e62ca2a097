//! Capability records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{CapabilityId, Epoch, ProcessId};
use crate::types::{Permissions, ResourceHandle, Tier};

/// Why a capability left the live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum RevocationCause {
    /// Revoked directly by a holder or the kernel.
    Explicit,
    /// An ancestor was revoked.
    Cascade { root: CapabilityId },
    /// Its own TTL elapsed.
    Expired,
    /// An ancestor's TTL elapsed.
    AncestorExpired { root: CapabilityId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub cause: RevocationCause,
    pub at: DateTime<Utc>,
}

/// Snapshot of a capability record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub resource: ResourceHandle,
    pub permissions: Permissions,
    pub owner: ProcessId,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub epoch: Epoch,
    pub parent: Option<CapabilityId>,
    pub revocation: Option<Revocation>,
}

impl Capability {
    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }

    /// Expiry is inclusive: a capability is dead at its `expires_at` instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired_at(now)
    }

    pub fn is_trusted(&self) -> bool {
        self.owner.is_kernel()
    }
}
