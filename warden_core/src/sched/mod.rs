//! Scheduler collaboration hooks.
//!
//! The core never owns threads. Wherever an operation has to wait (a full
//! Async channel, a pending response, a contended registry sweep) it calls
//! [`Scheduler::suspend`] for the caller's task and returns. When the
//! condition clears, the core calls [`Scheduler::resume`] with a [`Wakeup`]
//! describing what happened, and the scheduler makes the continuation
//! runnable again.
//!
//! A `suspend` for a task always happens before any `resume` that answers it.

pub mod cooperative;
pub mod tokio_adapter;

use serde::{Deserialize, Serialize};

use crate::id::{ChannelId, CorrelationId, TaskId};

pub use cooperative::{CooperativeScheduler, TaskState};
pub use tokio_adapter::TokioScheduler;

/// Why a task was suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspendReason {
    /// Sender parked on a full Async channel.
    QueueFull {
        channel: ChannelId,
        correlation: CorrelationId,
    },
    /// Receiver waiting for a correlated response.
    AwaitResponse {
        channel: ChannelId,
        correlation: CorrelationId,
    },
    /// Sweep waiting for concurrent delegate/revoke to release the registry.
    RecordLock,
}

/// What made a suspended task runnable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Wakeup {
    /// A parked request was moved into the queue.
    Enqueued {
        channel: ChannelId,
        correlation: CorrelationId,
    },
    /// The awaited response is available.
    ResponseReady {
        channel: ChannelId,
        correlation: CorrelationId,
    },
    /// The channel closed (or its capability was revoked) first.
    ChannelClosed {
        channel: ChannelId,
        correlation: CorrelationId,
    },
    /// The request was cancelled.
    Cancelled {
        channel: ChannelId,
        correlation: CorrelationId,
    },
    /// The registry lock is free; retry the sweep.
    LockReleased,
}

/// Hooks an external scheduler implements to drive Tier 2 progress.
///
/// Both methods are called with core locks held and must not call back
/// into the registry or channel manager.
pub trait Scheduler: Send + Sync {
    fn suspend(&self, task: TaskId, reason: SuspendReason);

    fn resume(&self, task: TaskId, wakeup: Wakeup);
}
