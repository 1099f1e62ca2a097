//! Per-channel state guarded by the channel mutex.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use super::queue::BoundedQueue;
use super::state::{ChannelState, CloseReason};
use crate::error::{CapabilityError, ChannelError, Error};
use crate::id::{CapabilityId, ChannelId, CorrelationId, Epoch, ProcessId, TaskId};
use crate::sched::Wakeup;
use crate::types::{Request, Response, Tier};

/// Wakeups collected under the channel lock, delivered after it is released.
pub(crate) type Wakeups = Vec<(TaskId, Wakeup)>;

#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub(crate) request: Request,
    /// Epoch of the bound capability when the request was accepted.
    pub(crate) epoch: Epoch,
    pub(crate) enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct ParkedSender {
    pub(crate) entry: QueuedRequest,
    pub(crate) task: TaskId,
}

#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) correlation: CorrelationId,
    /// Set when the request is cancelled after dequeue; the response is dropped.
    pub(crate) cancelled: bool,
}

#[derive(Debug)]
pub(crate) struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) capability: CapabilityId,
    pub(crate) owner: ProcessId,
    pub(crate) tier: Tier,
    pub(crate) state: ChannelState,
    pub(crate) bound_epoch: Epoch,
    pub(crate) queue: BoundedQueue<QueuedRequest>,
    pub(crate) parked: VecDeque<ParkedSender>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) responses: VecDeque<Response>,
    pub(crate) waiters: HashMap<CorrelationId, TaskId>,
    pub(crate) direct_held: bool,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        capability: CapabilityId,
        owner: ProcessId,
        tier: Tier,
        capacity: usize,
        bound_epoch: Epoch,
    ) -> Self {
        Self {
            id,
            capability,
            owner,
            tier,
            state: ChannelState::Created,
            bound_epoch,
            queue: BoundedQueue::new(capacity),
            parked: VecDeque::new(),
            in_flight: None,
            responses: VecDeque::new(),
            waiters: HashMap::new(),
            direct_held: false,
        }
    }

    pub(crate) fn ensure_owner(&self, caller: ProcessId) -> Result<(), Error> {
        if caller != self.owner {
            return Err(CapabilityError::PermissionDenied(format!(
                "{} does not own channel {}",
                caller, self.id
            ))
            .into());
        }
        Ok(())
    }

    /// The error reported to callers of a channel that is no longer usable.
    pub(crate) fn closed_error(&self) -> Error {
        match self.state {
            ChannelState::Closed(CloseReason::Revoked) => CapabilityError::Revoked(self.capability).into(),
            ChannelState::Created => ChannelError::InvalidState {
                channel: self.id,
                state: self.state,
            }
            .into(),
            _ => ChannelError::Closed(self.id).into(),
        }
    }

    pub(crate) fn ensure_not_revoked(&self) -> Result<(), Error> {
        if self.state == ChannelState::Closed(CloseReason::Revoked) {
            return Err(CapabilityError::Revoked(self.capability).into());
        }
        Ok(())
    }

    /// Whether the correlation id is queued, parked or in flight.
    pub(crate) fn is_pending(&self, correlation: CorrelationId) -> bool {
        self.queue.iter().any(|q| q.request.correlation == correlation)
            || self.parked.iter().any(|p| p.entry.request.correlation == correlation)
            || self.in_flight.as_ref().map_or(false, |f| f.correlation == correlation)
    }

    pub(crate) fn has_correlation(&self, correlation: CorrelationId) -> bool {
        self.is_pending(correlation) || self.responses.iter().any(|r| r.correlation == correlation)
    }

    /// Direct channels are single-slot: the slot is taken by a held guard,
    /// a queued request or one in flight.
    pub(crate) fn slot_busy(&self) -> bool {
        self.direct_held || !self.queue.is_empty() || self.in_flight.is_some()
    }

    /// Requests and unread responses the channel holds. Capacity bounds both,
    /// so an owner that never reads stops being able to send.
    pub(crate) fn occupancy(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some()) + self.responses.len()
    }

    fn below_capacity(&self) -> bool {
        self.occupancy() < self.queue.capacity()
    }

    pub(crate) fn has_room(&self) -> bool {
        match self.tier {
            Tier::Direct => !self.slot_busy() && self.responses.is_empty(),
            _ => self.below_capacity() && self.parked.is_empty(),
        }
    }

    /// Move parked senders into freed slots, oldest first.
    pub(crate) fn promote_parked(&mut self, wakeups: &mut Wakeups) -> usize {
        let mut promoted = 0;
        while self.below_capacity() {
            let Some(parked) = self.parked.pop_front() else {
                break;
            };
            let correlation = parked.entry.request.correlation;
            if let Err(entry) = self.queue.push(parked.entry) {
                self.parked.push_front(ParkedSender {
                    entry,
                    task: parked.task,
                });
                break;
            }
            wakeups.push((
                parked.task,
                Wakeup::Enqueued {
                    channel: self.id,
                    correlation,
                },
            ));
            promoted += 1;
        }
        promoted
    }

    /// Wake whoever awaits `correlation`.
    pub(crate) fn wake_waiter(&mut self, correlation: CorrelationId, wakeup: Wakeup, wakeups: &mut Wakeups) {
        if let Some(task) = self.waiters.remove(&correlation) {
            wakeups.push((task, wakeup));
        }
    }

    /// Closed with nothing left for the owner to read.
    pub(crate) fn is_spent(&self) -> bool {
        match self.state {
            ChannelState::Closed(CloseReason::Revoked) => true,
            ChannelState::Closed(CloseReason::Normal) => self.responses.is_empty() && self.in_flight.is_none(),
            _ => false,
        }
    }

    /// `Draining -> Closed` once nothing is left to service.
    pub(crate) fn finish_drain(&mut self) -> bool {
        if self.state == ChannelState::Draining && self.queue.is_empty() && self.in_flight.is_none() {
            self.state = ChannelState::Closed(CloseReason::Normal);
            return true;
        }
        false
    }

    /// Release parked senders with `ChannelClosed`, dropping their requests.
    pub(crate) fn release_parked(&mut self, wakeups: &mut Wakeups) {
        for parked in self.parked.drain(..) {
            let correlation = parked.entry.request.correlation;
            let wakeup = Wakeup::ChannelClosed {
                channel: self.id,
                correlation,
            };
            wakeups.push((parked.task, wakeup));
            if let Some(task) = self.waiters.remove(&correlation) {
                wakeups.push((task, wakeup));
            }
        }
    }

    /// Forced close: discard everything and resume every waiter.
    ///
    /// `Closed` is terminal, so a channel that already drained is left alone.
    pub(crate) fn close_revoked(&mut self, wakeups: &mut Wakeups) -> bool {
        if self.state.is_closed() {
            return false;
        }
        self.state = ChannelState::Closed(CloseReason::Revoked);
        self.release_parked(wakeups);

        self.queue.clear();
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.cancelled = true;
        }
        self.responses.clear();
        for (correlation, task) in self.waiters.drain() {
            wakeups.push((
                task,
                Wakeup::ChannelClosed {
                    channel: self.id,
                    correlation,
                },
            ));
        }
        true
    }
}
