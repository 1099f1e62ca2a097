//! Capability Registry
//!
//! Authoritative store of every capability ever minted. Records form a
//! delegation tree; revoking a node revokes its whole subtree. Records are
//! never deleted, so a dead id always resolves to a revoked record rather than
//! to nothing.
//!
//! All reads and mutations go through a single [`RwLock`], which linearizes
//! every operation on every record.

mod arena;
pub mod process_set;
pub mod record;

#[cfg(test)]
mod tests;

use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::CapabilityError;
use crate::id::{CapabilityId, Epoch, ProcessId, TaskId};
use crate::sched::{Scheduler, SuspendReason, Wakeup};
use crate::types::{Permissions, ResourceHandle, Tier};

use arena::CapabilityArena;
pub use process_set::ProcessCapabilitySet;
pub use record::{Capability, Revocation, RevocationCause};

/// Notified after capabilities transition to revoked.
///
/// Called outside the registry lock, once per mutation, with every id that
/// changed state in that mutation.
pub trait RevocationListener: Send + Sync {
    fn on_revoked(&self, revoked: &[CapabilityId]);
}

/// Result of a cooperative sweep attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAttempt {
    Swept(Vec<CapabilityId>),
    /// The registry was busy; the task is suspended until the lock frees.
    Suspended,
}

/// The capability registry.
pub struct CapabilityRegistry {
    arena: RwLock<CapabilityArena>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    listeners: RwLock<Vec<Weak<dyn RevocationListener>>>,
    /// Sweeps parked on a contended lock.
    lock_waiters: Mutex<Vec<TaskId>>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new(clock: Arc<dyn Clock>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            arena: RwLock::new(CapabilityArena::default()),
            clock,
            scheduler,
            listeners: RwLock::new(Vec::new()),
            lock_waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn add_listener(&self, listener: Weak<dyn RevocationListener>) {
        self.listeners.write().push(listener);
    }

    /// Mint a root capability with the owner's default tier.
    ///
    /// Kernel-owned capabilities default to [`Tier::Direct`], everything else
    /// to [`Tier::Async`].
    pub fn create(
        &self,
        resource: ResourceHandle,
        permissions: Permissions,
        owner: ProcessId,
        ttl: Option<Duration>,
    ) -> Result<CapabilityId, CapabilityError> {
        self.create_with_tier(resource, permissions, owner, Tier::default_for(owner), ttl)
    }

    /// Mint a root capability with an explicit tier.
    pub fn create_with_tier(
        &self,
        resource: ResourceHandle,
        permissions: Permissions,
        owner: ProcessId,
        tier: Tier,
        ttl: Option<Duration>,
    ) -> Result<CapabilityId, CapabilityError> {
        if permissions.is_empty() {
            return Err(CapabilityError::InvalidPermissions(
                "empty permission set".to_string(),
            ));
        }
        let supported = resource.kind.supported_permissions();
        if !permissions.is_subset_of(supported) {
            return Err(CapabilityError::InvalidPermissions(format!(
                "{} does not support {}",
                resource.kind,
                permissions - supported
            )));
        }
        match tier {
            Tier::Emergency => {
                return Err(CapabilityError::UnsupportedTier {
                    tier,
                    reason: "emergency is not a capability tier".to_string(),
                })
            }
            Tier::Direct if !owner.is_kernel() => {
                return Err(CapabilityError::UnsupportedTier {
                    tier,
                    reason: format!("{} is not trusted", owner),
                })
            }
            _ => {}
        }

        let now = self.clock.now();
        let capability = Capability {
            id: CapabilityId::new(),
            resource,
            permissions,
            owner,
            tier,
            created_at: now,
            expires_at: ttl.map(|ttl| expiry_after(now, ttl)),
            epoch: Epoch::default(),
            parent: None,
            revocation: None,
        };
        let id = capability.id;

        self.arena.write().insert(capability, None);
        self.after_write(&[]);

        info!(
            capability = %id,
            owner = %owner,
            resource = %resource,
            permissions = %permissions,
            tier = %tier,
            "Minted capability"
        );
        Ok(id)
    }

    /// Derive a child capability holding a subset of the parent's rights.
    ///
    /// The child's lifetime never outlasts the parent's. A `Direct` parent
    /// handing out to an untrusted owner yields an `Async` child.
    pub fn delegate(
        &self,
        parent: CapabilityId,
        subset: Permissions,
        new_owner: ProcessId,
        ttl: Option<Duration>,
    ) -> Result<CapabilityId, CapabilityError> {
        let now = self.clock.now();
        let child_id = CapabilityId::new();

        let result = {
            let mut arena = self.arena.write();
            match arena.index_of(&parent) {
                None => Err(CapabilityError::NotFound(parent)),
                Some(pidx) => {
                    Self::delegate_locked(&mut arena, pidx, subset, new_owner, ttl, now, child_id)
                }
            }
        };
        self.after_write(&[]);

        match &result {
            Ok(id) => info!(
                capability = %id,
                parent = %parent,
                owner = %new_owner,
                permissions = %subset,
                "Delegated capability"
            ),
            Err(e) => warn!(parent = %parent, error = %e, "Delegation refused"),
        }
        result
    }

    fn delegate_locked(
        arena: &mut CapabilityArena,
        pidx: usize,
        subset: Permissions,
        new_owner: ProcessId,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
        child_id: CapabilityId,
    ) -> Result<CapabilityId, CapabilityError> {
        let p = &arena.node(pidx).capability;
        let parent = p.id;

        if p.is_revoked() {
            return Err(CapabilityError::InvalidDelegation(format!(
                "parent {} is revoked",
                parent
            )));
        }
        if p.is_expired_at(now) {
            return Err(CapabilityError::InvalidDelegation(format!(
                "parent {} has expired",
                parent
            )));
        }
        if !p.permissions.contains(Permissions::DELEGATE) {
            return Err(CapabilityError::InvalidDelegation(format!(
                "parent {} does not carry delegate",
                parent
            )));
        }
        if subset.is_empty() {
            return Err(CapabilityError::InvalidDelegation(
                "empty permission set".to_string(),
            ));
        }
        if !subset.is_subset_of(p.permissions) {
            return Err(CapabilityError::InvalidDelegation(format!(
                "{} exceeds parent permissions {}",
                subset, p.permissions
            )));
        }

        let tier = match p.tier {
            Tier::Direct if !new_owner.is_kernel() => Tier::Async,
            tier => tier,
        };
        let child = Capability {
            id: child_id,
            resource: p.resource,
            permissions: subset,
            owner: new_owner,
            tier,
            created_at: now,
            expires_at: earliest(p.expires_at, ttl.map(|ttl| expiry_after(now, ttl))),
            epoch: Epoch::default(),
            parent: Some(parent),
            revocation: None,
        };
        arena.insert(child, Some(pidx));
        Ok(child_id)
    }

    /// Revoke a capability and its entire subtree.
    ///
    /// Returns the ids that changed state. Revoking an already revoked
    /// capability is a no-op returning an empty list.
    pub fn revoke(&self, id: CapabilityId) -> Result<Vec<CapabilityId>, CapabilityError> {
        let now = self.clock.now();
        let mut revoked = Vec::new();
        let found = {
            let mut arena = self.arena.write();
            match arena.index_of(&id) {
                Some(idx) => {
                    arena.revoke_subtree(
                        idx,
                        RevocationCause::Explicit,
                        RevocationCause::Cascade { root: id },
                        now,
                        &mut revoked,
                    );
                    true
                }
                None => false,
            }
        };
        self.after_write(&revoked);
        if !found {
            return Err(CapabilityError::NotFound(id));
        }

        if revoked.is_empty() {
            debug!(capability = %id, "Capability already revoked");
        } else {
            info!(capability = %id, cascaded = revoked.len() - 1, "Revoked capability");
        }
        Ok(revoked)
    }

    /// Revoke every capability owned by `owner`, with their subtrees.
    pub fn revoke_owned_by(&self, owner: ProcessId) -> Vec<CapabilityId> {
        let now = self.clock.now();
        let mut revoked = Vec::new();
        {
            let mut arena = self.arena.write();
            let owned: Vec<usize> = arena.owned_by(owner).to_vec();
            for idx in owned {
                let root = arena.node(idx).capability.id;
                arena.revoke_subtree(
                    idx,
                    RevocationCause::Explicit,
                    RevocationCause::Cascade { root },
                    now,
                    &mut revoked,
                );
            }
        }
        self.after_write(&revoked);

        if !revoked.is_empty() {
            info!(owner = %owner, count = revoked.len(), "Revoked capabilities of process");
        }
        revoked
    }

    /// Revoke every capability whose TTL has elapsed, cascading to descendants.
    pub fn sweep_expired(&self) -> Vec<CapabilityId> {
        let revoked = {
            let mut arena = self.arena.write();
            self.sweep_locked(&mut arena)
        };
        self.after_write(&revoked);
        revoked
    }

    /// Sweep without blocking on the registry lock.
    ///
    /// When a delegate or revoke holds the lock, `task` is suspended with
    /// [`SuspendReason::RecordLock`] and resumed with
    /// [`Wakeup::LockReleased`] once that mutation finishes.
    pub fn try_sweep_expired(&self, task: TaskId) -> SweepAttempt {
        let revoked = {
            let mut waiters = self.lock_waiters.lock();
            match self.arena.try_write() {
                Some(mut arena) => {
                    drop(waiters);
                    self.sweep_locked(&mut arena)
                }
                // Only readers hold it; they never park a sweep.
                None if !self.arena.is_locked_exclusive() => {
                    let mut arena = self.arena.write();
                    drop(waiters);
                    self.sweep_locked(&mut arena)
                }
                None => {
                    waiters.push(task);
                    self.scheduler.suspend(task, SuspendReason::RecordLock);
                    debug!(task = %task, "Sweep waiting for registry lock");
                    return SweepAttempt::Suspended;
                }
            }
        };
        self.after_write(&revoked);
        SweepAttempt::Swept(revoked)
    }

    fn sweep_locked(&self, arena: &mut CapabilityArena) -> Vec<CapabilityId> {
        let now = self.clock.now();
        let expired: Vec<usize> = (0..arena.len())
            .filter(|&idx| {
                let c = &arena.node(idx).capability;
                !c.is_revoked() && c.is_expired_at(now)
            })
            .collect();

        let mut revoked = Vec::new();
        for idx in expired {
            let root = arena.node(idx).capability.id;
            arena.revoke_subtree(
                idx,
                RevocationCause::Expired,
                RevocationCause::AncestorExpired { root },
                now,
                &mut revoked,
            );
        }
        if !revoked.is_empty() {
            info!(count = revoked.len(), "Swept expired capabilities");
        }
        revoked
    }

    /// Revoke every remaining live capability. Used at shutdown.
    pub fn revoke_all(&self) -> Vec<CapabilityId> {
        let now = self.clock.now();
        let mut revoked = Vec::new();
        {
            let mut arena = self.arena.write();
            for idx in 0..arena.len() {
                let root = arena.node(idx).capability.id;
                arena.revoke_subtree(
                    idx,
                    RevocationCause::Explicit,
                    RevocationCause::Cascade { root },
                    now,
                    &mut revoked,
                );
            }
        }
        self.after_write(&revoked);
        info!(count = revoked.len(), "Revoked all capabilities");
        revoked
    }

    pub fn get(&self, id: &CapabilityId) -> Option<Capability> {
        self.arena.read().get(id).cloned()
    }

    pub fn epoch(&self, id: &CapabilityId) -> Option<Epoch> {
        self.arena.read().get(id).map(|c| c.epoch)
    }

    /// Run `f` against the record under the read lock.
    pub(crate) fn inspect<R>(&self, id: &CapabilityId, f: impl FnOnce(Option<&Capability>) -> R) -> R {
        let arena = self.arena.read();
        f(arena.get(id))
    }

    /// The live capabilities `owner` holds right now.
    pub fn capability_set(&self, owner: ProcessId) -> ProcessCapabilitySet {
        let now = self.clock.now();
        let arena = self.arena.read();
        let mut set = ProcessCapabilitySet::new(owner);
        set.extend(
            arena
                .owned_by(owner)
                .iter()
                .map(|&idx| &arena.node(idx).capability)
                .filter(|c| c.is_live_at(now))
                .cloned(),
        );
        set
    }

    /// Whether `owner` holds a live capability over `resource` carrying every
    /// bit of `required`.
    pub fn holds(&self, owner: ProcessId, resource: &ResourceHandle, required: Permissions) -> bool {
        let now = self.clock.now();
        let arena = self.arena.read();
        arena
            .owned_by(owner)
            .iter()
            .map(|&idx| &arena.node(idx).capability)
            .any(|c| c.resource == *resource && c.permissions.contains(required) && c.is_live_at(now))
    }

    pub fn children(&self, id: &CapabilityId) -> Vec<CapabilityId> {
        let arena = self.arena.read();
        arena
            .index_of(id)
            .map(|idx| {
                arena
                    .node(idx)
                    .children
                    .iter()
                    .map(|&c| arena.node(c).capability.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `owner` holds `id` or one of its ancestors. The kernel controls everything.
    pub fn is_controlled_by(&self, id: &CapabilityId, owner: ProcessId) -> Result<bool, CapabilityError> {
        let arena = self.arena.read();
        let idx = arena.index_of(id).ok_or(CapabilityError::NotFound(*id))?;
        Ok(owner.is_kernel() || arena.ancestry(idx).any(|c| c.owner == owner))
    }

    /// Number of records ever minted, revoked ones included.
    pub fn len(&self) -> usize {
        self.arena.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_count(&self) -> usize {
        let now = self.clock.now();
        self.arena
            .read()
            .capabilities()
            .filter(|c| c.is_live_at(now))
            .count()
    }

    /// Runs after the write lock is released.
    fn after_write(&self, revoked: &[CapabilityId]) {
        if !revoked.is_empty() {
            let listeners: Vec<Arc<dyn RevocationListener>> =
                self.listeners.read().iter().filter_map(Weak::upgrade).collect();
            for listener in listeners {
                listener.on_revoked(revoked);
            }
        }

        let waiters = std::mem::take(&mut *self.lock_waiters.lock());
        for task in waiters {
            self.scheduler.resume(task, Wakeup::LockReleased);
        }
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_add_signed(ttl).unwrap_or(if ttl < Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
