use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use super::*;
use crate::channel::{CancelOutcome, ChannelState, CloseReason};
use crate::check::CheckStage;
use crate::clock::ManualClock;
use crate::config::{BootGrant, WardenConfig};
use crate::error::{CapabilityError, DispatchError, Error, ServiceError};
use crate::id::{ChannelId, CorrelationId, ProcessId};
use crate::kernel::{Kernel, KernelPhase};
use crate::provider::{MemoryProvider, ProviderTable, Resolved, ServiceProvider};
use crate::sched::{CooperativeScheduler, Wakeup};
use crate::check::CapabilityProof;
use crate::types::{
    CapabilityRequest, OperationKind, Payload, Permissions, Request, Response, ResourceKind,
    Tier,
};

const USER: ProcessId = ProcessId(5);

/// Memory provider that counts the operations it performs.
#[derive(Default)]
struct CountingMemory {
    inner: MemoryProvider,
    calls: AtomicUsize,
}

impl CountingMemory {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ServiceProvider for CountingMemory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Memory
    }

    fn resolve(&self, descriptor: &str) -> std::result::Result<Resolved, ServiceError> {
        self.inner.resolve(descriptor)
    }

    fn handle(
        &self,
        operation: OperationKind,
        proof: &CapabilityProof,
        payload: Payload,
    ) -> std::result::Result<Payload, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.handle(operation, proof, payload)
    }
}

struct Fixture {
    sched: Arc<CooperativeScheduler>,
    memory: Arc<CountingMemory>,
    kernel: Arc<Kernel>,
}

fn booted(config: WardenConfig) -> Fixture {
    let sched = Arc::new(CooperativeScheduler::new());
    let memory = Arc::new(CountingMemory::default());
    let mut providers = ProviderTable::with_defaults();
    providers.register(memory.clone());
    let kernel = Kernel::builder(config)
        .clock(Arc::new(ManualClock::new(Utc::now())))
        .scheduler(sched.clone())
        .providers(providers)
        .build()
        .unwrap();
    Fixture {
        sched,
        memory,
        kernel,
    }
}

fn running() -> Fixture {
    let f = booted(WardenConfig::default());
    f.kernel.start().unwrap();
    f
}

fn boot_grant(owner: u32) -> BootGrant {
    BootGrant {
        owner,
        kind: "memory".to_string(),
        descriptor: format!("boot-{}", owner),
        permissions: vec!["read".to_string(), "write".to_string()],
        ttl_secs: None,
    }
}

impl Fixture {
    fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.kernel.dispatcher()
    }

    fn memory_channel(&self, owner: ProcessId, descriptor: &str, permissions: Permissions) -> ChannelId {
        let cap = self
            .kernel
            .request(owner, CapabilityRequest::new(ResourceKind::Memory, descriptor, permissions))
            .unwrap();
        self.kernel.open_channel(owner, cap.id, Some(4)).unwrap().id
    }

    fn write(&self, n: u64, data: &[u8]) -> Request {
        Request::new(n, OperationKind::Write, json!({ "data": data }))
    }
}

#[test]
fn test_direct_invocation_runs_inline() {
    let f = running();
    let kernel = ProcessId::KERNEL;
    let ch = f.memory_channel(kernel, "scratch:8", Permissions::READ | Permissions::WRITE);
    let snapshot = f.kernel.channels().snapshot(ch).unwrap();
    assert_eq!(snapshot.tier, Tier::Direct);

    let written = f
        .dispatcher()
        .invoke_direct(kernel, ch, OperationKind::Write, json!({ "offset": 2, "data": [7, 8] }))
        .unwrap();
    assert_eq!(written, json!({ "written": 2 }));
    let read = f
        .dispatcher()
        .invoke_direct(kernel, ch, OperationKind::Read, json!({ "offset": 2, "len": 2 }))
        .unwrap();
    assert_eq!(read, json!({ "data": [7, 8] }));

    let audit = f.kernel.audit().entries(&snapshot.capability);
    assert_eq!(audit.len(), 2);
    assert!(audit.iter().all(|e| e.stage == CheckStage::Direct && e.allowed()));
    assert_eq!(f.memory.calls(), 2);
}

#[test]
fn test_direct_denial_never_reaches_provider() {
    let f = running();
    let kernel = ProcessId::KERNEL;
    let ch = f.memory_channel(kernel, "ro:8", Permissions::READ);

    let err = f
        .dispatcher()
        .invoke_direct(kernel, ch, OperationKind::Write, json!({ "data": [1] }))
        .unwrap_err();
    assert!(matches!(err, Error::Capability(CapabilityError::PermissionDenied(_))));
    assert_eq!(f.memory.calls(), 0);

    let cap = f.kernel.channels().snapshot(ch).unwrap().capability;
    f.kernel.revoke(kernel, cap).unwrap();
    let err = f
        .dispatcher()
        .invoke_direct(kernel, ch, OperationKind::Read, json!({ "len": 1 }))
        .unwrap_err();
    assert_eq!(err, Error::Capability(CapabilityError::Revoked(cap)));
    assert_eq!(f.memory.calls(), 0);
}

#[test]
fn test_async_requests_run_in_order() {
    let f = running();
    let ch = f.memory_channel(USER, "buf:4", Permissions::READ | Permissions::WRITE);
    assert_eq!(f.kernel.channels().snapshot(ch).unwrap().tier, Tier::Async);

    f.dispatcher().submit(USER, ch, f.write(1, &[1, 2]), None).unwrap();
    f.dispatcher()
        .submit(USER, ch, Request::new(2u64, OperationKind::Read, json!({ "len": 2 })), None)
        .unwrap();
    f.dispatcher()
        .submit(USER, ch, Request::new(3u64, OperationKind::Read, json!({ "offset": 3, "len": 2 })), None)
        .unwrap();

    assert_eq!(f.dispatcher().run_until_idle(), 3);
    assert_eq!(f.dispatcher().run_until_idle(), 0);

    let responses: Vec<Response> = std::iter::from_fn(|| f.dispatcher().receive(USER, ch).unwrap()).collect();
    let order: Vec<u64> = responses.iter().map(|r| r.correlation.0).collect();
    assert_eq!(order, vec![1, 2, 3]);
    assert_eq!(responses[1].result, Ok(json!({ "data": [1, 2] })));
    assert!(matches!(
        responses[2].result,
        Err(Error::Service(ServiceError::Failed(_)))
    ));
}

#[test]
fn test_run_until_idle_services_channels_round_robin() {
    let f = running();
    let a = f.memory_channel(USER, "a", Permissions::WRITE);
    let b = f.memory_channel(USER, "b", Permissions::WRITE);
    for n in 1..=3 {
        f.dispatcher().submit(USER, a, f.write(n, &[1]), None).unwrap();
    }
    f.dispatcher().submit(USER, b, f.write(1, &[1]), None).unwrap();

    assert!(f.dispatcher().service_once(b));
    assert!(!f.dispatcher().service_once(b));
    assert_eq!(f.dispatcher().run_until_idle(), 3);
}

#[test]
fn test_revocation_after_dequeue_denies_execution() {
    let f = running();
    let ch = f.memory_channel(USER, "race:4", Permissions::READ | Permissions::WRITE);
    let cap = f.kernel.channels().snapshot(ch).unwrap().capability;

    f.dispatcher().submit(USER, ch, f.write(1, &[9]), None).unwrap();
    let dispatch = f.kernel.channels().dequeue(ch).unwrap();

    f.kernel.revoke(USER, cap).unwrap();
    let result = f.dispatcher().execute(dispatch);
    assert_eq!(result, Err(Error::Capability(CapabilityError::Revoked(cap))));
    assert_eq!(f.memory.calls(), 0);

    let delivered = f
        .kernel
        .channels()
        .complete(
            ch,
            Response {
                correlation: CorrelationId(1),
                result,
            },
        )
        .unwrap();
    assert!(!delivered);

    let denials: Vec<_> = f
        .kernel
        .audit()
        .entries(&cap)
        .into_iter()
        .filter(|e| !e.allowed())
        .collect();
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].stage, CheckStage::PreExecute);
}

#[test]
fn test_revocation_with_queued_work_runs_nothing() {
    let f = running();
    let ch = f.memory_channel(USER, "queued:4", Permissions::WRITE);
    let cap = f.kernel.channels().snapshot(ch).unwrap().capability;
    for n in 1..=3 {
        f.dispatcher().submit(USER, ch, f.write(n, &[n as u8]), None).unwrap();
    }
    let waiter = f.sched.spawn();
    f.sched.next_runnable();
    f.dispatcher()
        .await_response(USER, ch, CorrelationId(3), waiter)
        .unwrap();

    f.kernel.revoke(USER, cap).unwrap();
    assert_eq!(f.dispatcher().run_until_idle(), 0);
    assert_eq!(f.memory.calls(), 0);
    assert!(matches!(
        f.sched.next_runnable(),
        Some((task, Some(Wakeup::ChannelClosed { .. }))) if task == waiter
    ));
    assert!(f
        .dispatcher()
        .poll_response(USER, ch, CorrelationId(3))
        .unwrap_err()
        .is_revoked());
}

#[test]
fn test_cancellation_before_and_after_dequeue() {
    let f = running();
    let ch = f.memory_channel(USER, "cancel:4", Permissions::WRITE);
    f.dispatcher().submit(USER, ch, f.write(1, &[1]), None).unwrap();
    f.dispatcher().submit(USER, ch, f.write(2, &[2]), None).unwrap();

    assert_eq!(
        f.dispatcher().cancel(USER, ch, CorrelationId(2)).unwrap(),
        CancelOutcome::Removed
    );

    let dispatch = f.kernel.channels().dequeue(ch).unwrap();
    assert_eq!(
        f.dispatcher().cancel(USER, ch, CorrelationId(1)).unwrap(),
        CancelOutcome::WillDiscard
    );
    // The provider is not interrupted; only the response is dropped.
    let result = f.dispatcher().execute(dispatch);
    assert!(result.is_ok());
    let delivered = f
        .kernel
        .channels()
        .complete(ch, Response { correlation: CorrelationId(1), result })
        .unwrap();
    assert!(!delivered);

    assert_eq!(f.memory.calls(), 1);
    assert_eq!(f.dispatcher().run_until_idle(), 0);
    assert!(f.dispatcher().receive(USER, ch).unwrap().is_none());
}

#[test]
fn test_tiers_one_and_two_wait_for_running() {
    let f = booted(WardenConfig::default());
    let ch = f.memory_channel(USER, "early", Permissions::WRITE);

    let err = f.dispatcher().submit(USER, ch, f.write(1, &[1]), None).unwrap_err();
    assert_eq!(err, Error::Dispatch(DispatchError::NotRunning(KernelPhase::Booting)));

    f.kernel.start().unwrap();
    f.dispatcher().submit(USER, ch, f.write(1, &[1]), None).unwrap();

    f.kernel.shutdown().unwrap();
    let err = f.dispatcher().receive(USER, ch).unwrap_err();
    assert_eq!(err, Error::Dispatch(DispatchError::NotRunning(KernelPhase::ShutDown)));
}

#[test]
fn test_trap_hands_out_initial_capabilities_during_boot() {
    let mut config = WardenConfig::default();
    config.boot.grants = vec![boot_grant(1), boot_grant(2)];
    let f = booted(config);

    let set = f.dispatcher().trap(ProcessId(1), TRAP_ACQUIRE_INITIAL_CAPABILITIES).unwrap();
    assert_eq!(set.len(), 1);
    let id = set.ids()[0];
    assert_eq!(f.kernel.processes().initial_capabilities(ProcessId(1)), vec![id]);
    let cap = set.get(&id).unwrap();
    assert_eq!(cap.permissions, Permissions::READ | Permissions::WRITE);
    assert_eq!(cap.tier, Tier::Async);

    assert!(f.dispatcher().trap(ProcessId(3), TRAP_ACQUIRE_INITIAL_CAPABILITIES).unwrap().is_empty());
}

#[test]
fn test_trap_after_boot_terminates_the_caller() {
    let mut config = WardenConfig::default();
    config.boot.grants = vec![boot_grant(1)];
    let f = booted(config);
    let set = f.dispatcher().trap(ProcessId(1), TRAP_ACQUIRE_INITIAL_CAPABILITIES).unwrap();
    let cap = set.ids()[0];
    let ch = f.kernel.open_channel(ProcessId(1), cap, None).unwrap().id;
    f.kernel.start().unwrap();

    let err = f
        .dispatcher()
        .trap(ProcessId(1), TRAP_ACQUIRE_INITIAL_CAPABILITIES)
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(f.kernel.processes().is_terminated(ProcessId(1)));
    assert!(f.kernel.registry().capability_set(ProcessId(1)).is_empty());
    assert_eq!(
        f.kernel.channels().state(ch).unwrap(),
        ChannelState::Closed(CloseReason::Revoked)
    );

    let err = f.dispatcher().submit(ProcessId(1), ch, f.write(1, &[1]), None).unwrap_err();
    assert_eq!(err, Error::Dispatch(DispatchError::ProcessTerminated(ProcessId(1))));
    let err = f.dispatcher().trap(ProcessId(1), TRAP_ACQUIRE_INITIAL_CAPABILITIES).unwrap_err();
    assert_eq!(err, Error::Dispatch(DispatchError::ProcessTerminated(ProcessId(1))));
}

#[test]
fn test_unknown_trap_code_is_fatal_even_during_boot() {
    let mut config = WardenConfig::default();
    config.boot.grants = vec![boot_grant(4)];
    let f = booted(config);

    let err = f.dispatcher().trap(ProcessId(4), 0x7f).unwrap_err();
    assert!(matches!(err, Error::Dispatch(DispatchError::ProtocolViolation(_))));
    assert!(f.kernel.processes().is_terminated(ProcessId(4)));
    assert_eq!(f.kernel.registry().live_count(), 0);
}

#[test]
fn test_debug_switch_keeps_trap_open() {
    let mut config = WardenConfig::default();
    config.emergency.debug = true;
    config.boot.grants = vec![boot_grant(1)];
    let f = booted(config);
    f.kernel.start().unwrap();

    let set = f.dispatcher().trap(ProcessId(1), TRAP_ACQUIRE_INITIAL_CAPABILITIES).unwrap();
    assert_eq!(set.len(), 1);
    assert!(!f.kernel.processes().is_terminated(ProcessId(1)));
}
