use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;

use super::*;
use crate::clock::ManualClock;
use crate::sched::{CooperativeScheduler, TaskState};
use crate::types::ResourceKind;

struct Fixture {
    clock: Arc<ManualClock>,
    sched: Arc<CooperativeScheduler>,
    registry: CapabilityRegistry,
}

fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let sched = Arc::new(CooperativeScheduler::new());
    let registry = CapabilityRegistry::new(clock.clone(), sched.clone());
    Fixture {
        clock,
        sched,
        registry,
    }
}

fn region(handle: u64) -> ResourceHandle {
    ResourceHandle::new(ResourceKind::Memory, handle)
}

fn rwd() -> Permissions {
    Permissions::READ | Permissions::WRITE | Permissions::DELEGATE
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Vec<CapabilityId>>>,
}

impl RevocationListener for Recorder {
    fn on_revoked(&self, revoked: &[CapabilityId]) {
        self.seen.lock().push(revoked.to_vec());
    }
}

#[test]
fn test_create_defaults_tier_by_owner() {
    let f = fixture();
    let kernel_cap = f
        .registry
        .create(region(1), Permissions::READ, ProcessId::KERNEL, None)
        .unwrap();
    let user_cap = f
        .registry
        .create(region(2), Permissions::READ, ProcessId(4), None)
        .unwrap();

    assert_eq!(f.registry.get(&kernel_cap).unwrap().tier, Tier::Direct);
    let user = f.registry.get(&user_cap).unwrap();
    assert_eq!(user.tier, Tier::Async);
    assert_eq!(user.epoch, Epoch(0));
    assert!(user.parent.is_none());
    assert!(!user.is_revoked());
}

#[test]
fn test_create_rejects_bad_permissions_and_tiers() {
    let f = fixture();
    let storage = ResourceHandle::new(ResourceKind::Storage, 1);

    let err = f
        .registry
        .create(storage, Permissions::EXECUTE, ProcessId(1), None)
        .unwrap_err();
    assert!(matches!(err, CapabilityError::InvalidPermissions(_)));

    let err = f
        .registry
        .create(region(1), Permissions::empty(), ProcessId(1), None)
        .unwrap_err();
    assert!(matches!(err, CapabilityError::InvalidPermissions(_)));

    let err = f
        .registry
        .create_with_tier(region(1), Permissions::READ, ProcessId(1), Tier::Direct, None)
        .unwrap_err();
    assert!(matches!(err, CapabilityError::UnsupportedTier { tier: Tier::Direct, .. }));

    let err = f
        .registry
        .create_with_tier(region(1), Permissions::READ, ProcessId::KERNEL, Tier::Emergency, None)
        .unwrap_err();
    assert!(matches!(err, CapabilityError::UnsupportedTier { tier: Tier::Emergency, .. }));
    assert!(f.registry.is_empty());
}

#[test]
fn test_delegation_chain_narrows_permissions() {
    let f = fixture();
    let root = f
        .registry
        .create(region(1), rwd(), ProcessId(1), None)
        .unwrap();
    let mid = f
        .registry
        .delegate(root, Permissions::READ | Permissions::DELEGATE, ProcessId(2), None)
        .unwrap();
    let leaf = f
        .registry
        .delegate(mid, Permissions::READ, ProcessId(3), None)
        .unwrap();

    let mut current = Some(leaf);
    while let Some(id) = current {
        let cap = f.registry.get(&id).unwrap();
        if let Some(parent) = cap.parent {
            let parent_cap = f.registry.get(&parent).unwrap();
            assert!(cap.permissions.is_subset_of(parent_cap.permissions));
            assert_eq!(cap.resource, parent_cap.resource);
        }
        current = cap.parent;
    }

    // Escalation past the intermediate node is refused.
    let err = f
        .registry
        .delegate(mid, Permissions::WRITE, ProcessId(3), None)
        .unwrap_err();
    assert!(matches!(err, CapabilityError::InvalidDelegation(_)));

    // The leaf lacks DELEGATE.
    let err = f
        .registry
        .delegate(leaf, Permissions::READ, ProcessId(4), None)
        .unwrap_err();
    assert!(matches!(err, CapabilityError::InvalidDelegation(_)));

    assert_eq!(f.registry.children(&root), vec![mid]);
    assert_eq!(f.registry.children(&mid), vec![leaf]);
}

#[test]
fn test_delegate_unknown_and_dead_parents() {
    let f = fixture();
    let err = f
        .registry
        .delegate(CapabilityId::new(), Permissions::READ, ProcessId(2), None)
        .unwrap_err();
    assert!(matches!(err, CapabilityError::NotFound(_)));

    let root = f
        .registry
        .create(region(1), rwd(), ProcessId(1), None)
        .unwrap();
    f.registry.revoke(root).unwrap();
    let err = f
        .registry
        .delegate(root, Permissions::READ, ProcessId(2), None)
        .unwrap_err();
    assert!(matches!(err, CapabilityError::InvalidDelegation(_)));

    let expiring = f
        .registry
        .create(region(2), rwd(), ProcessId(1), Some(Duration::seconds(5)))
        .unwrap();
    f.clock.advance(Duration::seconds(5));
    let err = f
        .registry
        .delegate(expiring, Permissions::READ, ProcessId(2), None)
        .unwrap_err();
    assert!(matches!(err, CapabilityError::InvalidDelegation(_)));
}

#[test]
fn test_direct_parent_demoted_for_untrusted_child() {
    let f = fixture();
    let root = f
        .registry
        .create(region(1), rwd(), ProcessId::KERNEL, None)
        .unwrap();
    let to_kernel = f
        .registry
        .delegate(root, Permissions::READ, ProcessId::KERNEL, None)
        .unwrap();
    let to_user = f
        .registry
        .delegate(root, Permissions::READ, ProcessId(9), None)
        .unwrap();

    assert_eq!(f.registry.get(&to_kernel).unwrap().tier, Tier::Direct);
    assert_eq!(f.registry.get(&to_user).unwrap().tier, Tier::Async);
}

#[test]
fn test_child_expiry_never_outlives_parent() {
    let f = fixture();
    let root = f
        .registry
        .create(region(1), rwd(), ProcessId(1), Some(Duration::seconds(10)))
        .unwrap();
    let child = f
        .registry
        .delegate(root, Permissions::READ, ProcessId(2), Some(Duration::seconds(60)))
        .unwrap();
    let unbounded = f
        .registry
        .delegate(root, Permissions::READ, ProcessId(2), None)
        .unwrap();

    let parent_expiry = f.registry.get(&root).unwrap().expires_at;
    assert_eq!(f.registry.get(&child).unwrap().expires_at, parent_expiry);
    assert_eq!(f.registry.get(&unbounded).unwrap().expires_at, parent_expiry);
}

#[test]
fn test_revoke_cascades_only_to_subtree() {
    let f = fixture();
    let a = f
        .registry
        .create(region(1), rwd(), ProcessId(1), None)
        .unwrap();
    let b = f.registry.delegate(a, rwd(), ProcessId(2), None).unwrap();
    let c = f
        .registry
        .delegate(b, Permissions::READ, ProcessId(3), None)
        .unwrap();
    let d = f
        .registry
        .delegate(a, Permissions::READ, ProcessId(4), None)
        .unwrap();

    let mut revoked = f.registry.revoke(b).unwrap();
    revoked.sort_by_key(|id| id.uuid());
    let mut expected = vec![b, c];
    expected.sort_by_key(|id| id.uuid());
    assert_eq!(revoked, expected);

    let a_cap = f.registry.get(&a).unwrap();
    let b_cap = f.registry.get(&b).unwrap();
    let c_cap = f.registry.get(&c).unwrap();
    let d_cap = f.registry.get(&d).unwrap();

    assert!(!a_cap.is_revoked());
    assert!(!d_cap.is_revoked());
    assert_eq!(b_cap.revocation.unwrap().cause, RevocationCause::Explicit);
    assert_eq!(
        c_cap.revocation.unwrap().cause,
        RevocationCause::Cascade { root: b }
    );
    assert_eq!(b_cap.epoch, Epoch(1));
    assert_eq!(c_cap.epoch, Epoch(1));
    assert_eq!(a_cap.epoch, Epoch(0));
}

#[test]
fn test_revoke_is_idempotent_and_unknown_is_not_found() {
    let f = fixture();
    let a = f
        .registry
        .create(region(1), rwd(), ProcessId(1), None)
        .unwrap();
    assert_eq!(f.registry.revoke(a).unwrap(), vec![a]);
    assert!(f.registry.revoke(a).unwrap().is_empty());
    assert_eq!(f.registry.epoch(&a), Some(Epoch(1)));

    let err = f.registry.revoke(CapabilityId::new()).unwrap_err();
    assert!(matches!(err, CapabilityError::NotFound(_)));

    // Records are never deleted.
    assert_eq!(f.registry.len(), 1);
}

#[test]
fn test_sweep_expires_and_cascades() {
    let f = fixture();
    let root = f
        .registry
        .create(region(1), rwd(), ProcessId(1), Some(Duration::seconds(10)))
        .unwrap();
    let child = f
        .registry
        .delegate(root, Permissions::READ, ProcessId(2), None)
        .unwrap();
    let other = f
        .registry
        .create(region(2), rwd(), ProcessId(1), None)
        .unwrap();

    assert!(f.registry.sweep_expired().is_empty());
    f.clock.advance(Duration::seconds(11));

    let swept = f.registry.sweep_expired();
    assert_eq!(swept.len(), 2);
    assert_eq!(
        f.registry.get(&root).unwrap().revocation.unwrap().cause,
        RevocationCause::Expired
    );
    // The child shares the parent's expiry but is reached through the cascade.
    assert_eq!(
        f.registry.get(&child).unwrap().revocation.unwrap().cause,
        RevocationCause::AncestorExpired { root }
    );
    assert!(!f.registry.get(&other).unwrap().is_revoked());
    assert!(f.registry.sweep_expired().is_empty());
}

#[test]
fn test_negative_ttl_is_already_expired() {
    let f = fixture();
    let cap = f
        .registry
        .create(region(1), Permissions::READ, ProcessId(1), Some(Duration::seconds(-1)))
        .unwrap();
    assert!(f.registry.capability_set(ProcessId(1)).is_empty());
    assert_eq!(f.registry.sweep_expired(), vec![cap]);
}

#[test]
fn test_capability_set_tracks_owner() {
    let f = fixture();
    let a = f
        .registry
        .create(region(1), rwd(), ProcessId(1), None)
        .unwrap();
    let b = f
        .registry
        .create(region(2), Permissions::READ, ProcessId(1), None)
        .unwrap();
    f.registry.create(region(3), Permissions::READ, ProcessId(2), None).unwrap();

    let set = f.registry.capability_set(ProcessId(1));
    assert_eq!(set.len(), 2);
    assert!(set.contains(&a) && set.contains(&b));

    f.registry.revoke(b).unwrap();
    let set = f.registry.capability_set(ProcessId(1));
    assert_eq!(set.ids(), vec![a]);
}

#[test]
fn test_revoke_owned_by_and_revoke_all() {
    let f = fixture();
    let a = f
        .registry
        .create(region(1), rwd(), ProcessId(1), None)
        .unwrap();
    let delegated = f
        .registry
        .delegate(a, Permissions::READ, ProcessId(2), None)
        .unwrap();
    let kept = f
        .registry
        .create(region(2), Permissions::READ, ProcessId(2), None)
        .unwrap();

    let revoked = f.registry.revoke_owned_by(ProcessId(1));
    assert_eq!(revoked, vec![a, delegated]);
    assert_eq!(f.registry.live_count(), 1);

    assert_eq!(f.registry.revoke_all(), vec![kept]);
    assert_eq!(f.registry.live_count(), 0);
    assert!(f.registry.revoke_all().is_empty());
}

#[test]
fn test_controlled_by_ancestor_owner() {
    let f = fixture();
    let a = f
        .registry
        .create(region(1), rwd(), ProcessId(1), None)
        .unwrap();
    let b = f
        .registry
        .delegate(a, Permissions::READ, ProcessId(2), None)
        .unwrap();

    assert!(f.registry.is_controlled_by(&b, ProcessId(1)).unwrap());
    assert!(f.registry.is_controlled_by(&b, ProcessId(2)).unwrap());
    assert!(!f.registry.is_controlled_by(&a, ProcessId(2)).unwrap());
    assert!(f.registry.is_controlled_by(&a, ProcessId::KERNEL).unwrap());
}

#[test]
fn test_listeners_see_revocations() {
    let f = fixture();
    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn RevocationListener> = recorder.clone();
    f.registry.add_listener(Arc::downgrade(&listener));

    let a = f
        .registry
        .create(region(1), rwd(), ProcessId(1), None)
        .unwrap();
    let b = f
        .registry
        .delegate(a, Permissions::READ, ProcessId(2), None)
        .unwrap();
    f.registry.revoke(a).unwrap();
    f.registry.revoke(a).unwrap();

    let seen = recorder.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], vec![a, b]);
}

#[test]
fn test_contended_sweep_suspends_until_lock_released() {
    let f = fixture();
    let cap = f
        .registry
        .create(region(1), rwd(), ProcessId(1), Some(Duration::seconds(1)))
        .unwrap();
    f.clock.advance(Duration::seconds(2));

    let task = f.sched.spawn();
    f.sched.next_runnable();

    {
        // A concurrent mutation holds the lock.
        let _held = f.registry.arena.write();
        assert_eq!(f.registry.try_sweep_expired(task), SweepAttempt::Suspended);
    }
    assert_eq!(
        f.sched.state(task),
        Some(TaskState::Suspended(SuspendReason::RecordLock))
    );

    // The next mutation to finish wakes the sweep.
    f.registry
        .create(region(2), Permissions::READ, ProcessId(1), None)
        .unwrap();
    assert_eq!(f.sched.next_runnable(), Some((task, Some(Wakeup::LockReleased))));
    assert_eq!(f.registry.try_sweep_expired(task), SweepAttempt::Swept(vec![cap]));
}
