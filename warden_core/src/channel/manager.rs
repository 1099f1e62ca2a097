//! Channel Manager
//!
//! Owns every channel, enforces backpressure and correlation rules, and
//! force-closes channels when their bound capability is revoked.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::inner::{Channel, InFlight, ParkedSender, QueuedRequest, Wakeups};
use super::retired::{Retired, Tombstone, RETIRED_CHANNELS};
use super::state::{ChannelState, CloseReason};
use crate::check::{AuditLog, CheckStage, Decision, PermissionEvaluator};
use crate::config::ChannelConfig;
use crate::error::{CapabilityError, ChannelError, Error, Result};
use crate::id::{CapabilityId, ChannelId, CorrelationId, Epoch, ProcessId, TaskId};
use crate::provider::ProviderTable;
use crate::registry::{CapabilityRegistry, RevocationListener};
use crate::sched::{Scheduler, SuspendReason, Wakeup};
use crate::types::{Permissions, Request, Response, Tier};

/// What a caller gets back from creating a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub id: ChannelId,
    pub capability: CapabilityId,
    pub tier: Tier,
    pub capacity: usize,
}

/// Point-in-time view of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub capability: CapabilityId,
    pub owner: ProcessId,
    pub tier: Tier,
    pub capacity: usize,
    pub state: ChannelState,
    pub queued: usize,
    pub parked: usize,
    pub in_flight: Option<CorrelationId>,
    pub responses: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The request is in the queue.
    Queued,
    /// The queue was full; the sender's task is parked until a slot frees.
    Suspended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    Ready(Response),
    /// The caller's task is suspended until the response arrives.
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// Still queued; removed without reaching the provider.
    Removed,
    /// Already dequeued; its response will be dropped.
    WillDiscard,
    /// The response had arrived and was dropped.
    ResponseDiscarded,
}

/// A request handed to the dispatcher for execution.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub channel: ChannelId,
    pub capability: CapabilityId,
    pub owner: ProcessId,
    pub request: Request,
    /// Epoch captured when the request was accepted.
    pub epoch: Epoch,
    pub enqueued_at: DateTime<Utc>,
}

/// Exclusive use of a Direct channel's single slot.
///
/// The slot is released when the guard is dropped.
pub struct DirectSlot {
    channel: Arc<Mutex<Channel>>,
    id: ChannelId,
    capability: CapabilityId,
    owner: ProcessId,
}

impl DirectSlot {
    pub fn channel(&self) -> ChannelId {
        self.id
    }

    pub fn capability(&self) -> CapabilityId {
        self.capability
    }

    pub fn owner(&self) -> ProcessId {
        self.owner
    }
}

impl Drop for DirectSlot {
    fn drop(&mut self) {
        self.channel.lock().direct_held = false;
    }
}

impl std::fmt::Debug for DirectSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectSlot")
            .field("channel", &self.id)
            .field("capability", &self.capability)
            .finish()
    }
}

/// The channel manager.
pub struct ChannelManager {
    channels: DashMap<ChannelId, Arc<Mutex<Channel>>>,
    by_capability: DashMap<CapabilityId, Vec<ChannelId>>,
    retired: Mutex<Retired>,
    registry: Arc<CapabilityRegistry>,
    evaluator: PermissionEvaluator,
    providers: Arc<ProviderTable>,
    scheduler: Arc<dyn Scheduler>,
    audit: AuditLog,
    config: ChannelConfig,
    work: Arc<Notify>,
}

impl ChannelManager {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        providers: Arc<ProviderTable>,
        scheduler: Arc<dyn Scheduler>,
        audit: AuditLog,
        config: ChannelConfig,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            by_capability: DashMap::new(),
            retired: Mutex::new(Retired::new(RETIRED_CHANNELS)),
            evaluator: PermissionEvaluator::new(registry.clone()),
            registry,
            providers,
            scheduler,
            audit,
            config,
            work: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever a channel may have work for the dispatcher.
    pub fn work_notify(&self) -> Arc<Notify> {
        self.work.clone()
    }

    pub fn default_capacity(&self) -> usize {
        self.config.default_capacity
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Bind a new channel to a capability. The channel starts `Created`.
    pub fn create_channel(
        &self,
        caller: ProcessId,
        capability: CapabilityId,
        tier: Tier,
        capacity: usize,
    ) -> Result<ChannelHandle> {
        let proof = self
            .evaluator
            .authorize(capability, Permissions::empty(), None)?;

        if proof.holder() != caller {
            return Err(CapabilityError::PermissionDenied(format!(
                "{} does not own capability {}",
                caller, capability
            ))
            .into());
        }
        if !proof.permissions().can_use() {
            return Err(CapabilityError::PermissionDenied(format!(
                "capability {} carries no operational permission",
                capability
            ))
            .into());
        }

        let cap_tier = self
            .registry
            .get(&capability)
            .map(|c| c.tier)
            .ok_or(CapabilityError::NotFound(capability))?;
        let kind = proof.resource().kind;
        let unsupported = |reason: String| -> Error { CapabilityError::UnsupportedTier { tier, reason }.into() };
        if !tier.is_channel_tier() {
            return Err(unsupported("emergency is not a channel tier".to_string()));
        }
        if tier != cap_tier {
            return Err(unsupported(format!("capability {} is {}", capability, cap_tier)));
        }
        if !self.providers.supports(kind, tier) {
            return Err(unsupported(format!("{} provider does not serve this tier", kind)));
        }

        if capacity == 0 || capacity > self.config.max_capacity {
            return Err(ChannelError::InvalidCapacity(capacity).into());
        }
        let capacity = match tier {
            Tier::Direct => 1,
            _ => capacity,
        };

        let id = ChannelId::new();
        let channel = Channel::new(id, capability, caller, tier, capacity, proof.epoch());
        self.channels.insert(id, Arc::new(Mutex::new(channel)));
        self.by_capability.entry(capability).or_default().push(id);

        // A revocation that landed between the check and the index update
        // would have missed this channel.
        if !self
            .evaluator
            .check(capability, Permissions::empty(), proof.epoch())
            .is_allowed()
        {
            self.force_close(id);
            return Err(CapabilityError::Revoked(capability).into());
        }

        info!(
            channel = %id,
            capability = %capability,
            owner = %caller,
            tier = %tier,
            capacity,
            "Created channel"
        );
        Ok(ChannelHandle {
            id,
            capability,
            tier,
            capacity,
        })
    }

    /// `Created -> Open`.
    pub fn open(&self, caller: ProcessId, channel: ChannelId) -> Result<()> {
        let ch = self.lookup(channel)?;
        let mut ch = ch.lock();
        ch.ensure_owner(caller)?;
        if ch.state != ChannelState::Created {
            ch.ensure_not_revoked()?;
            return Err(ChannelError::InvalidState {
                channel,
                state: ch.state,
            }
            .into());
        }
        ch.state = ChannelState::Open;
        debug!(channel = %channel, "Channel opened");
        Ok(())
    }

    /// Stop accepting requests. Queued work still completes while `Draining`.
    pub fn close(&self, caller: ProcessId, channel: ChannelId) -> Result<ChannelState> {
        let ch = self.lookup(channel)?;
        let mut wakeups = Wakeups::new();
        let (state, spent) = {
            let mut ch = ch.lock();
            ch.ensure_owner(caller)?;
            match ch.state {
                ChannelState::Created => ch.state = ChannelState::Closed(CloseReason::Normal),
                ChannelState::Open => {
                    ch.release_parked(&mut wakeups);
                    ch.state = ChannelState::Draining;
                    ch.finish_drain();
                }
                _ => return Err(ch.closed_error()),
            }
            (ch.state, ch.is_spent())
        };
        self.deliver(wakeups);
        info!(channel = %channel, state = %state, "Channel closed by owner");
        if spent {
            self.retire(channel);
        }
        Ok(state)
    }

    /// Jump straight to `Closed(Revoked)`, discarding pending work.
    fn force_close(&self, channel: ChannelId) {
        let Some(ch) = self.get(channel) else {
            return;
        };
        let mut wakeups = Wakeups::new();
        let (closed, spent) = {
            let mut ch = ch.lock();
            let closed = ch.close_revoked(&mut wakeups);
            (closed, ch.is_spent())
        };
        self.deliver(wakeups);
        if closed {
            info!(channel = %channel, "Channel force-closed after revocation");
        }
        if spent {
            self.retire(channel);
        }
    }

    /// Queue a request.
    ///
    /// On a full Async channel the request is parked with `task` and the task
    /// suspended; without a task, or on a Direct channel, the caller gets
    /// `QueueFull` immediately.
    pub fn enqueue(
        &self,
        caller: ProcessId,
        channel: ChannelId,
        request: Request,
        task: Option<TaskId>,
    ) -> Result<EnqueueOutcome> {
        let ch = self.lookup(channel)?;
        let mut ch = ch.lock();
        ch.ensure_owner(caller)?;
        if ch.state != ChannelState::Open {
            return Err(ch.closed_error());
        }
        let correlation = request.correlation;
        if ch.has_correlation(correlation) {
            return Err(ChannelError::DuplicateCorrelation(correlation).into());
        }

        let requested = request.operation.required_permission();
        let decision = self.evaluator.check(ch.capability, requested, ch.bound_epoch);
        let now = self.registry.clock().now();
        self.audit
            .record(now, ch.capability, caller, requested, CheckStage::Enqueue, decision);
        if let Decision::Deny(reason) = decision {
            warn!(channel = %channel, correlation = %correlation, reason = %reason, "Enqueue denied");
            return Err(reason.into_error(ch.capability).into());
        }

        let entry = QueuedRequest {
            request,
            epoch: ch.bound_epoch,
            enqueued_at: now,
        };

        if ch.has_room() {
            if ch.queue.push(entry).is_err() {
                return Err(ChannelError::QueueFull(channel).into());
            }
            drop(ch);
            self.work.notify_one();
            debug!(channel = %channel, correlation = %correlation, "Request queued");
            return Ok(EnqueueOutcome::Queued);
        }

        match (ch.tier, task) {
            (Tier::Async, Some(task)) => {
                ch.parked.push_back(ParkedSender { entry, task });
                self.scheduler
                    .suspend(task, SuspendReason::QueueFull { channel, correlation });
                debug!(channel = %channel, correlation = %correlation, task = %task, "Sender parked");
                Ok(EnqueueOutcome::Suspended)
            }
            _ => Err(ChannelError::QueueFull(channel).into()),
        }
    }

    /// Take the next request off a channel, if it may run now.
    ///
    /// At most one request per channel is in flight, which keeps responses
    /// in queue order.
    pub fn dequeue(&self, channel: ChannelId) -> Option<Dispatch> {
        let ch = self.get(channel)?;
        let mut ch = ch.lock();
        if !ch.state.is_serviceable() || ch.in_flight.is_some() {
            return None;
        }
        // The request keeps its slot while in flight.
        let entry = ch.queue.pop()?;
        ch.in_flight = Some(InFlight {
            correlation: entry.request.correlation,
            cancelled: false,
        });
        Some(Dispatch {
            channel,
            capability: ch.capability,
            owner: ch.owner,
            request: entry.request,
            epoch: entry.epoch,
            enqueued_at: entry.enqueued_at,
        })
    }

    /// Record the result of the in-flight request.
    ///
    /// Returns `false` when the response was dropped because the request was
    /// cancelled or the channel force-closed meanwhile.
    pub fn complete(&self, channel: ChannelId, response: Response) -> Result<bool> {
        let Some(ch) = self.get(channel) else {
            // Destroyed by revocation while the provider ran.
            return match self.tombstone(channel) {
                Some(_) => Ok(false),
                None => Err(ChannelError::NotFound(channel).into()),
            };
        };
        let correlation = response.correlation;
        let mut wakeups = Wakeups::new();
        let (delivered, more_work, spent) = {
            let mut ch = ch.lock();
            let in_flight = match ch.in_flight.take() {
                Some(f) if f.correlation == correlation => f,
                other => {
                    ch.in_flight = other;
                    return Err(ChannelError::UnknownCorrelation(correlation).into());
                }
            };

            let delivered = if in_flight.cancelled || ch.state.is_closed() {
                debug!(channel = %channel, correlation = %correlation, "Response discarded");
                false
            } else {
                ch.responses.push_back(response);
                ch.wake_waiter(
                    correlation,
                    Wakeup::ResponseReady { channel, correlation },
                    &mut wakeups,
                );
                true
            };
            ch.promote_parked(&mut wakeups);
            if ch.finish_drain() {
                info!(channel = %channel, "Channel drained");
            }
            (
                delivered,
                ch.state.is_serviceable() && !ch.queue.is_empty(),
                ch.is_spent(),
            )
        };
        self.deliver(wakeups);
        if more_work {
            self.work.notify_one();
        }
        if spent {
            self.retire(channel);
        }
        Ok(delivered)
    }

    /// Take the response for `correlation` if it has arrived.
    pub fn poll_response(
        &self,
        caller: ProcessId,
        channel: ChannelId,
        correlation: CorrelationId,
    ) -> Result<Option<Response>> {
        let ch = self.lookup(channel)?;
        let mut wakeups = Wakeups::new();
        let (response, spent) = {
            let mut ch = ch.lock();
            let response = Self::take_response(&mut ch, caller, correlation, &mut wakeups)?;
            (response, ch.is_spent())
        };
        self.release(wakeups);
        if spent {
            self.retire(channel);
        }
        Ok(response)
    }

    /// Take the response, or suspend `task` until it arrives.
    pub fn await_response(
        &self,
        caller: ProcessId,
        channel: ChannelId,
        correlation: CorrelationId,
        task: TaskId,
    ) -> Result<AwaitOutcome> {
        let ch = self.lookup(channel)?;
        let mut wakeups = Wakeups::new();
        let (outcome, spent) = {
            let mut ch = ch.lock();
            let outcome = match Self::take_response(&mut ch, caller, correlation, &mut wakeups)? {
                Some(response) => AwaitOutcome::Ready(response),
                None => {
                    ch.waiters.insert(correlation, task);
                    self.scheduler
                        .suspend(task, SuspendReason::AwaitResponse { channel, correlation });
                    AwaitOutcome::Suspended
                }
            };
            (outcome, ch.is_spent())
        };
        self.release(wakeups);
        if spent {
            self.retire(channel);
        }
        Ok(outcome)
    }

    /// Reading a response frees its slot for a parked sender.
    fn take_response(
        ch: &mut MutexGuard<'_, Channel>,
        caller: ProcessId,
        correlation: CorrelationId,
        wakeups: &mut Wakeups,
    ) -> Result<Option<Response>> {
        ch.ensure_owner(caller)?;
        ch.ensure_not_revoked()?;
        if let Some(pos) = ch.responses.iter().position(|r| r.correlation == correlation) {
            let response = ch.responses.remove(pos);
            ch.promote_parked(wakeups);
            return Ok(response);
        }
        if ch.is_pending(correlation) {
            return Ok(None);
        }
        Err(ChannelError::UnknownCorrelation(correlation).into())
    }

    /// Take the oldest undelivered response.
    pub fn receive(&self, caller: ProcessId, channel: ChannelId) -> Result<Option<Response>> {
        let ch = self.lookup(channel)?;
        let mut wakeups = Wakeups::new();
        let (response, spent) = {
            let mut ch = ch.lock();
            ch.ensure_owner(caller)?;
            ch.ensure_not_revoked()?;
            let response = ch.responses.pop_front();
            if response.is_some() {
                ch.promote_parked(&mut wakeups);
            }
            (response, ch.is_spent())
        };
        self.release(wakeups);
        if spent {
            self.retire(channel);
        }
        Ok(response)
    }

    /// Cancel a request.
    ///
    /// Providers are never interrupted: a request already dequeued runs to
    /// completion and its response is dropped.
    pub fn cancel(
        &self,
        caller: ProcessId,
        channel: ChannelId,
        correlation: CorrelationId,
    ) -> Result<CancelOutcome> {
        let ch = self.lookup(channel)?;
        let mut wakeups = Wakeups::new();
        let cancelled = Wakeup::Cancelled { channel, correlation };
        let (outcome, spent) = {
            let mut ch = ch.lock();
            ch.ensure_owner(caller)?;
            ch.ensure_not_revoked()?;

            let outcome = if ch
                .queue
                .remove_first(|q| q.request.correlation == correlation)
                .is_some()
            {
                ch.promote_parked(&mut wakeups);
                ch.finish_drain();
                CancelOutcome::Removed
            } else if let Some(pos) = ch
                .parked
                .iter()
                .position(|p| p.entry.request.correlation == correlation)
            {
                if let Some(parked) = ch.parked.remove(pos) {
                    wakeups.push((parked.task, cancelled));
                }
                CancelOutcome::Removed
            } else if let Some(in_flight) = ch.in_flight.as_mut().filter(|f| f.correlation == correlation) {
                in_flight.cancelled = true;
                CancelOutcome::WillDiscard
            } else if let Some(pos) = ch.responses.iter().position(|r| r.correlation == correlation) {
                ch.responses.remove(pos);
                ch.promote_parked(&mut wakeups);
                CancelOutcome::ResponseDiscarded
            } else {
                return Err(ChannelError::UnknownCorrelation(correlation).into());
            };
            ch.wake_waiter(correlation, cancelled, &mut wakeups);
            (outcome, ch.is_spent())
        };
        self.release(wakeups);
        if spent {
            self.retire(channel);
        }
        debug!(channel = %channel, correlation = %correlation, outcome = ?outcome, "Request cancelled");
        Ok(outcome)
    }

    /// Take the single slot of a Direct channel.
    pub fn acquire_direct(&self, caller: ProcessId, channel: ChannelId) -> Result<DirectSlot> {
        let arc = self.lookup(channel)?;
        let mut ch = arc.lock();
        ch.ensure_owner(caller)?;
        if ch.tier != Tier::Direct {
            return Err(ChannelError::WrongTier {
                channel,
                tier: ch.tier,
            }
            .into());
        }
        if ch.state != ChannelState::Open {
            return Err(ch.closed_error());
        }
        if ch.slot_busy() {
            return Err(ChannelError::QueueFull(channel).into());
        }
        ch.direct_held = true;
        let slot = DirectSlot {
            channel: arc.clone(),
            id: channel,
            capability: ch.capability,
            owner: ch.owner,
        };
        drop(ch);
        Ok(slot)
    }

    /// Destroyed channels report how they closed.
    pub fn state(&self, channel: ChannelId) -> Result<ChannelState> {
        match self.get(channel) {
            Some(ch) => {
                let state = ch.lock().state;
                Ok(state)
            }
            None => self
                .tombstone(channel)
                .map(|t| ChannelState::Closed(t.reason))
                .ok_or_else(|| ChannelError::NotFound(channel).into()),
        }
    }

    pub fn queued_len(&self, channel: ChannelId) -> Result<usize> {
        let ch = self.lookup(channel)?;
        let len = ch.lock().queue.len();
        Ok(len)
    }

    pub fn snapshot(&self, channel: ChannelId) -> Result<ChannelSnapshot> {
        let ch = self.lookup(channel)?;
        let ch = ch.lock();
        Ok(ChannelSnapshot {
            id: ch.id,
            capability: ch.capability,
            owner: ch.owner,
            tier: ch.tier,
            capacity: ch.queue.capacity(),
            state: ch.state,
            queued: ch.queue.len(),
            parked: ch.parked.len(),
            in_flight: ch.in_flight.as_ref().map(|f| f.correlation),
            responses: ch.responses.len(),
        })
    }

    /// Channels bound to a capability.
    pub fn channels_for(&self, capability: &CapabilityId) -> Vec<ChannelId> {
        self.by_capability
            .get(capability)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|entry| *entry.key()).collect()
    }

    /// Channels with queued work and nothing in flight.
    pub fn ready_channels(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|entry| {
                let ch = entry.value().lock();
                ch.state.is_serviceable() && ch.in_flight.is_none() && !ch.queue.is_empty()
            })
            .map(|entry| *entry.key())
            .collect()
    }

    fn get(&self, channel: ChannelId) -> Option<Arc<Mutex<Channel>>> {
        self.channels.get(&channel).map(|c| c.value().clone())
    }

    fn lookup(&self, channel: ChannelId) -> Result<Arc<Mutex<Channel>>> {
        self.get(channel).ok_or_else(|| match self.tombstone(channel) {
            Some(tombstone) => tombstone.error(channel),
            None => ChannelError::NotFound(channel).into(),
        })
    }

    fn tombstone(&self, channel: ChannelId) -> Option<Tombstone> {
        self.retired.lock().get(&channel)
    }

    /// Destroy a spent channel, leaving a tombstone for late callers.
    fn retire(&self, channel: ChannelId) {
        let Some((_, ch)) = self
            .channels
            .remove_if(&channel, |_, ch| ch.lock().is_spent())
        else {
            return;
        };
        let (capability, reason) = {
            let ch = ch.lock();
            match ch.state {
                ChannelState::Closed(reason) => (ch.capability, reason),
                _ => return,
            }
        };
        if let Some(mut ids) = self.by_capability.get_mut(&capability) {
            ids.retain(|id| *id != channel);
        }
        self.by_capability.remove_if(&capability, |_, ids| ids.is_empty());
        self.retired
            .lock()
            .insert(channel, Tombstone { capability, reason });
        debug!(channel = %channel, reason = ?reason, "Channel destroyed");
    }

    /// Resume tasks once no channel lock is held.
    fn deliver(&self, wakeups: Wakeups) {
        for (task, wakeup) in wakeups {
            self.scheduler.resume(task, wakeup);
        }
    }

    /// Deliver wakeups, telling the dispatcher when parked requests moved in.
    fn release(&self, wakeups: Wakeups) {
        let promoted = wakeups
            .iter()
            .any(|(_, wakeup)| matches!(wakeup, Wakeup::Enqueued { .. }));
        self.deliver(wakeups);
        if promoted {
            self.work.notify_one();
        }
    }
}

impl RevocationListener for ChannelManager {
    fn on_revoked(&self, revoked: &[CapabilityId]) {
        for capability in revoked {
            for channel in self.channels_for(capability) {
                self.force_close(channel);
            }
        }
    }
}
