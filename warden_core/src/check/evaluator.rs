//! Permission evaluation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CapabilityError;
use crate::id::{CapabilityId, Epoch, ProcessId};
use crate::registry::{Capability, CapabilityRegistry};
use crate::types::{Permissions, ResourceHandle};

/// Why a check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    Unknown,
    Revoked,
    Expired,
    /// The capability changed state after the caller observed `expected`.
    EpochMismatch { expected: Epoch, current: Epoch },
    MissingPermission {
        requested: Permissions,
        held: Permissions,
    },
}

impl DenyReason {
    /// Map onto the caller-facing error taxonomy.
    pub fn into_error(self, id: CapabilityId) -> CapabilityError {
        match self {
            DenyReason::Unknown => CapabilityError::NotFound(id),
            DenyReason::Revoked | DenyReason::EpochMismatch { .. } => CapabilityError::Revoked(id),
            DenyReason::Expired => CapabilityError::Expired(id),
            DenyReason::MissingPermission { requested, held } => CapabilityError::PermissionDenied(
                format!("{} requires {} but holds {}", id, requested, held),
            ),
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Unknown => write!(f, "unknown capability"),
            DenyReason::Revoked => write!(f, "revoked"),
            DenyReason::Expired => write!(f, "expired"),
            DenyReason::EpochMismatch { expected, current } => {
                write!(f, "epoch {} observed, now {}", expected, current)
            }
            DenyReason::MissingPermission { requested, held } => {
                write!(f, "requested {} but holds {}", requested, held)
            }
        }
    }
}

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    /// Collapse an evaluation into a decision.
    pub fn of<T>(result: &std::result::Result<T, DenyReason>) -> Decision {
        match result {
            Ok(_) => Decision::Allow,
            Err(reason) => Decision::Deny(*reason),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Evidence that a check passed, handed to service providers.
///
/// Only the evaluator constructs proofs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityProof {
    id: CapabilityId,
    resource: ResourceHandle,
    permissions: Permissions,
    epoch: Epoch,
    holder: ProcessId,
}

impl CapabilityProof {
    fn from_capability(capability: &Capability) -> Self {
        Self {
            id: capability.id,
            resource: capability.resource,
            permissions: capability.permissions,
            epoch: capability.epoch,
            holder: capability.owner,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(resource: ResourceHandle, permissions: Permissions) -> Self {
        Self {
            id: CapabilityId::new(),
            resource,
            permissions,
            epoch: Epoch::default(),
            holder: ProcessId(1),
        }
    }

    pub fn id(&self) -> CapabilityId {
        self.id
    }

    pub fn resource(&self) -> ResourceHandle {
        self.resource
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn holder(&self) -> ProcessId {
        self.holder
    }
}

/// Decides whether a capability authorizes a permission right now.
///
/// The answer is a pure function of registry state and the clock; the
/// evaluator keeps no state of its own.
#[derive(Clone)]
pub struct PermissionEvaluator {
    registry: Arc<CapabilityRegistry>,
}

impl PermissionEvaluator {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// Check `requested` against the capability as observed at `expected_epoch`.
    ///
    /// Order: unknown, revoked, expired, epoch, permission bits. Expiry is
    /// evaluated against the clock, so a capability is dead at its expiry
    /// instant even if no sweep has run.
    pub fn check(&self, id: CapabilityId, requested: Permissions, expected_epoch: Epoch) -> Decision {
        match self.evaluate(id, requested, Some(expected_epoch)) {
            Ok(_) => Decision::Allow,
            Err(reason) => Decision::Deny(reason),
        }
    }

    /// Check against whatever epoch the capability currently has.
    pub fn check_current(&self, id: CapabilityId, requested: Permissions) -> Decision {
        match self.evaluate(id, requested, None) {
            Ok(_) => Decision::Allow,
            Err(reason) => Decision::Deny(reason),
        }
    }

    /// `Result` form of [`check`](Self::check) yielding a proof on success.
    pub fn authorize(
        &self,
        id: CapabilityId,
        requested: Permissions,
        expected_epoch: Option<Epoch>,
    ) -> Result<CapabilityProof, CapabilityError> {
        self.evaluate(id, requested, expected_epoch)
            .map_err(|reason| reason.into_error(id))
    }

    /// Evaluate and keep the deny reason, for callers that audit it.
    pub fn evaluate(
        &self,
        id: CapabilityId,
        requested: Permissions,
        expected_epoch: Option<Epoch>,
    ) -> Result<CapabilityProof, DenyReason> {
        let now = self.registry.clock().now();
        let result = self.registry.inspect(&id, |record| {
            let capability = record.ok_or(DenyReason::Unknown)?;
            if capability.is_revoked() {
                return Err(DenyReason::Revoked);
            }
            if capability.is_expired_at(now) {
                return Err(DenyReason::Expired);
            }
            if let Some(expected) = expected_epoch {
                if expected != capability.epoch {
                    return Err(DenyReason::EpochMismatch {
                        expected,
                        current: capability.epoch,
                    });
                }
            }
            if !capability.permissions.contains(requested) {
                return Err(DenyReason::MissingPermission {
                    requested,
                    held: capability.permissions,
                });
            }
            Ok(CapabilityProof::from_capability(capability))
        });

        if let Err(reason) = &result {
            debug!(capability = %id, requested = %requested, reason = %reason, "Check denied");
        }
        result
    }
}
