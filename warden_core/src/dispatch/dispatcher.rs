//! Tiered Dispatcher
//!
//! Routes invocations by tier. Direct calls run inline under the channel's
//! single slot. Async requests are checked when queued and again, against the
//! epoch captured then, right before the provider runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::{AwaitOutcome, CancelOutcome, ChannelManager, Dispatch, EnqueueOutcome};
use crate::check::{CapabilityProof, CheckStage, Decision, DenyReason, PermissionEvaluator};
use crate::error::{DispatchError, Error, Result};
use crate::id::{CapabilityId, ChannelId, CorrelationId, ProcessId, TaskId};
use crate::kernel::{KernelPhase, PhaseCell, ProcessTable};
use crate::provider::ProviderTable;
use crate::registry::CapabilityRegistry;
use crate::types::{OperationKind, Payload, Permissions, Request, Response};

/// Routes invocations to providers by tier.
pub struct Dispatcher {
    pub(super) registry: Arc<CapabilityRegistry>,
    pub(super) channels: Arc<ChannelManager>,
    evaluator: PermissionEvaluator,
    providers: Arc<ProviderTable>,
    pub(super) processes: Arc<ProcessTable>,
    pub(super) phase: Arc<PhaseCell>,
    pub(super) emergency_debug: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        channels: Arc<ChannelManager>,
        providers: Arc<ProviderTable>,
        processes: Arc<ProcessTable>,
        phase: Arc<PhaseCell>,
        emergency_debug: bool,
    ) -> Self {
        Self {
            evaluator: PermissionEvaluator::new(registry.clone()),
            registry,
            channels,
            providers,
            processes,
            phase,
            emergency_debug,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn phase(&self) -> KernelPhase {
        self.phase.get()
    }

    /// Tiers 1 and 2 are only served while running, and never to a
    /// terminated process.
    fn ensure_serving(&self, caller: ProcessId) -> Result<()> {
        let phase = self.phase.get();
        if phase != KernelPhase::Running {
            return Err(DispatchError::NotRunning(phase).into());
        }
        if self.processes.is_terminated(caller) {
            return Err(DispatchError::ProcessTerminated(caller).into());
        }
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.registry.clock().now()
    }

    fn audited(
        &self,
        capability: CapabilityId,
        caller: ProcessId,
        requested: Permissions,
        stage: CheckStage,
        result: std::result::Result<CapabilityProof, DenyReason>,
    ) -> std::result::Result<CapabilityProof, DenyReason> {
        self.channels.audit().record(
            self.now(),
            capability,
            caller,
            requested,
            stage,
            Decision::of(&result),
        );
        result
    }

    fn call_provider(&self, operation: OperationKind, proof: &CapabilityProof, payload: Payload) -> Result<Payload> {
        let kind = proof.resource().kind;
        let provider = self
            .providers
            .get(kind)
            .ok_or(DispatchError::NoProvider(kind))?;
        Ok(provider.handle(operation, proof, payload)?)
    }

    /// Tier 1: run `operation` inline on a Direct channel.
    ///
    /// The caller holds the channel's only slot for the duration of the
    /// provider call; a concurrent caller gets `QueueFull`.
    pub fn invoke_direct(
        &self,
        caller: ProcessId,
        channel: ChannelId,
        operation: OperationKind,
        payload: Payload,
    ) -> Result<Payload> {
        self.ensure_serving(caller)?;
        let slot = self.channels.acquire_direct(caller, channel)?;
        let capability = slot.capability();
        let requested = operation.required_permission();

        let checked = self.evaluator.evaluate(capability, requested, None);
        let proof = self
            .audited(capability, caller, requested, CheckStage::Direct, checked)
            .map_err(|reason| reason.into_error(capability))?;

        let result = self.call_provider(operation, &proof, payload);
        debug!(
            channel = %channel,
            operation = %operation,
            ok = result.is_ok(),
            "Direct invocation finished"
        );
        drop(slot);
        result
    }

    /// Tier 2: queue a request. See [`ChannelManager::enqueue`].
    pub fn submit(
        &self,
        caller: ProcessId,
        channel: ChannelId,
        request: Request,
        task: Option<TaskId>,
    ) -> Result<EnqueueOutcome> {
        self.ensure_serving(caller)?;
        self.channels.enqueue(caller, channel, request, task)
    }

    /// Service the head of one channel. Returns whether a request ran.
    pub fn service_once(&self, channel: ChannelId) -> bool {
        let Some(dispatch) = self.channels.dequeue(channel) else {
            return false;
        };
        let correlation = dispatch.request.correlation;
        let result = self.execute(dispatch);

        match self.channels.complete(channel, Response { correlation, result }) {
            Ok(true) => debug!(channel = %channel, correlation = %correlation, "Response delivered"),
            Ok(false) => debug!(channel = %channel, correlation = %correlation, "Response dropped"),
            Err(e) => warn!(channel = %channel, correlation = %correlation, error = %e, "Completion rejected"),
        }
        true
    }

    /// Re-check a dequeued request at its enqueue-time epoch and run it.
    pub(crate) fn execute(&self, dispatch: Dispatch) -> std::result::Result<Payload, Error> {
        let Dispatch {
            channel,
            capability,
            owner,
            request,
            epoch,
            ..
        } = dispatch;
        let requested = request.operation.required_permission();

        let checked = self.evaluator.evaluate(capability, requested, Some(epoch));
        let proof = match self.audited(capability, owner, requested, CheckStage::PreExecute, checked) {
            Ok(proof) => proof,
            Err(reason) => {
                warn!(
                    channel = %channel,
                    correlation = %request.correlation,
                    reason = %reason,
                    "Pre-execution check denied"
                );
                return Err(reason.into_error(capability).into());
            }
        };
        self.call_provider(request.operation, &proof, request.payload)
    }

    /// Service every ready channel round-robin until none has work.
    ///
    /// Returns the number of requests that ran.
    pub fn run_until_idle(&self) -> usize {
        let mut serviced = 0;
        loop {
            let ready = self.channels.ready_channels();
            if ready.is_empty() {
                return serviced;
            }
            for channel in ready {
                if self.service_once(channel) {
                    serviced += 1;
                }
            }
        }
    }

    /// Worker loop: service queued work whenever a channel signals it, until
    /// shutdown is broadcast.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting dispatcher loop");
        let work = self.channels.work_notify();
        loop {
            let serviced = self.run_until_idle();
            if serviced > 0 {
                debug!(serviced, "Dispatcher pass finished");
            }
            tokio::select! {
                _ = work.notified() => {}
                _ = shutdown.recv() => break,
            }
        }
        info!("Dispatcher loop stopped");
    }

    pub fn poll_response(
        &self,
        caller: ProcessId,
        channel: ChannelId,
        correlation: CorrelationId,
    ) -> Result<Option<Response>> {
        self.ensure_serving(caller)?;
        self.channels.poll_response(caller, channel, correlation)
    }

    pub fn await_response(
        &self,
        caller: ProcessId,
        channel: ChannelId,
        correlation: CorrelationId,
        task: TaskId,
    ) -> Result<AwaitOutcome> {
        self.ensure_serving(caller)?;
        self.channels.await_response(caller, channel, correlation, task)
    }

    pub fn receive(&self, caller: ProcessId, channel: ChannelId) -> Result<Option<Response>> {
        self.ensure_serving(caller)?;
        self.channels.receive(caller, channel)
    }

    pub fn cancel(
        &self,
        caller: ProcessId,
        channel: ChannelId,
        correlation: CorrelationId,
    ) -> Result<CancelOutcome> {
        self.ensure_serving(caller)?;
        self.channels.cancel(caller, channel, correlation)
    }
}
