//! Async client for Tier 2 channels.
//!
//! Bridges the core's suspend/resume hooks onto tokio: each operation that
//! may suspend registers a task with the [`TokioScheduler`] and awaits its
//! wakeup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::Dispatcher;
use crate::channel::{AwaitOutcome, CancelOutcome, ChannelState, CloseReason, EnqueueOutcome};
use crate::error::{CapabilityError, ChannelError, DispatchError, Error, Result};
use crate::id::{ChannelId, CorrelationId, ProcessId, TaskId};
use crate::sched::{TokioScheduler, Wakeup};
use crate::types::{OperationKind, Payload, Request};

/// A process's handle on one open Async channel.
pub struct AsyncClient {
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<TokioScheduler>,
    caller: ProcessId,
    channel: ChannelId,
    next_correlation: AtomicU64,
    timeout: Duration,
}

impl AsyncClient {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        scheduler: Arc<TokioScheduler>,
        caller: ProcessId,
        channel: ChannelId,
        timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            scheduler,
            caller,
            channel,
            next_correlation: AtomicU64::new(0),
            timeout,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Queue a request, waiting for room if the channel is full.
    pub async fn send(&self, operation: OperationKind, payload: Payload) -> Result<CorrelationId> {
        let correlation = CorrelationId(self.next_correlation.fetch_add(1, Ordering::Relaxed) + 1);
        let task = self.scheduler.register();
        let result = self.send_as(task, Request::new(correlation, operation, payload)).await;
        self.scheduler.unregister(task);
        result
    }

    async fn send_as(&self, task: TaskId, request: Request) -> Result<CorrelationId> {
        let correlation = request.correlation;
        match self
            .dispatcher
            .submit(self.caller, self.channel, request, Some(task))?
        {
            EnqueueOutcome::Queued => return Ok(correlation),
            EnqueueOutcome::Suspended => debug!(channel = %self.channel, correlation = %correlation, "Waiting for queue space"),
        }

        match tokio::time::timeout(self.timeout, self.scheduler.wait(task)).await {
            Ok(Some(Wakeup::Enqueued { .. })) => Ok(correlation),
            Ok(Some(Wakeup::ChannelClosed { .. })) => Err(self.closed_error()),
            Ok(_) => Err(DispatchError::Cancelled(correlation).into()),
            Err(_) => {
                self.abandon(task, correlation);
                Err(self.timeout_error())
            }
        }
    }

    /// Wait up to `timeout` for the response to `correlation`.
    ///
    /// On timeout the request is cancelled, so a late response is dropped.
    pub async fn response(&self, correlation: CorrelationId, timeout: Duration) -> Result<Payload> {
        let task = self.scheduler.register();
        let result = self.response_as(task, correlation, timeout).await;
        self.scheduler.unregister(task);
        result
    }

    async fn response_as(&self, task: TaskId, correlation: CorrelationId, timeout: Duration) -> Result<Payload> {
        let deadline = Instant::now() + timeout;
        loop {
            let outcome = self
                .dispatcher
                .await_response(self.caller, self.channel, correlation, task)?;
            if let AwaitOutcome::Ready(response) = outcome {
                return response.result;
            }

            match tokio::time::timeout_at(deadline, self.scheduler.wait(task)).await {
                Ok(Some(Wakeup::ResponseReady { .. })) => continue,
                Ok(Some(Wakeup::ChannelClosed { .. })) => return Err(self.closed_error()),
                Ok(_) => return Err(DispatchError::Cancelled(correlation).into()),
                Err(_) => {
                    self.abandon(task, correlation);
                    return Err(DispatchError::Timeout(timeout.as_millis() as u64).into());
                }
            }
        }
    }

    /// Send and wait for the response with the client's default timeout.
    pub async fn call(&self, operation: OperationKind, payload: Payload) -> Result<Payload> {
        let correlation = self.send(operation, payload).await?;
        self.response(correlation, self.timeout).await
    }

    pub fn cancel(&self, correlation: CorrelationId) -> Result<CancelOutcome> {
        self.dispatcher.cancel(self.caller, self.channel, correlation)
    }

    fn abandon(&self, task: TaskId, correlation: CorrelationId) {
        let waiting_on = self.scheduler.suspended_reason(task);
        if let Err(e) = self.cancel(correlation) {
            debug!(correlation = %correlation, error = %e, "Nothing to cancel after timeout");
        } else {
            warn!(
                channel = %self.channel,
                correlation = %correlation,
                waiting_on = ?waiting_on,
                "Request timed out and was cancelled"
            );
        }
    }

    fn timeout_error(&self) -> Error {
        DispatchError::Timeout(self.timeout.as_millis() as u64).into()
    }

    /// Report a close the way the channel itself would.
    fn closed_error(&self) -> Error {
        match self.dispatcher.channels().snapshot(self.channel) {
            Ok(snapshot) if snapshot.state == ChannelState::Closed(CloseReason::Revoked) => {
                CapabilityError::Revoked(snapshot.capability).into()
            }
            Ok(_) => ChannelError::Closed(self.channel).into(),
            Err(e) => e,
        }
    }
}
