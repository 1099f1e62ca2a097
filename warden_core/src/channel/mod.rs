//! Capability channels.
//!
//! A channel is bound to exactly one capability and carries requests to the
//! provider of that capability's resource. Direct channels have a single
//! slot and never suspend; Async channels queue up to their capacity and
//! park further senders.

mod inner;
pub mod manager;
mod queue;
mod retired;
pub mod state;


pub use manager::{
    AwaitOutcome, CancelOutcome, ChannelHandle, ChannelManager, ChannelSnapshot, DirectSlot, Dispatch,
    EnqueueOutcome,
};
pub use state::{ChannelState, CloseReason};
