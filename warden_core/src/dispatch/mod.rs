//! Tiered dispatch.
//!
//! * Tier 1, Direct: synchronous, single-slot, checked inline.
//! * Tier 2, Async: queued with backpressure, checked at enqueue and again
//!   before execution, answered with correlated responses.
//! * Tier 3, Emergency: the boot-time trap.

pub mod client;
pub mod dispatcher;
pub mod emergency;

#[cfg(test)]
mod tests;

pub use client::AsyncClient;
pub use dispatcher::Dispatcher;
pub use emergency::TRAP_ACQUIRE_INITIAL_CAPABILITIES;
