//! # Warden Core
//!
//! `warden_core` is a capability channel substrate: every interaction between
//! a process and a service goes through a channel backed by an unforgeable
//! capability.
//!
//! Key concepts:
//!
//! 1. **Capability Registry**: authoritative, linearizable store of
//!    capabilities forming a delegation tree. Revocation cascades.
//!
//! 2. **Permission Evaluator**: pure checks producing a proof that the
//!    dispatcher hands to a provider.
//!
//! 3. **Channels**: bounded queues bound to one capability. Revoking the
//!    capability force-closes the channel and wakes everyone on it.
//!
//! 4. **Tiered Dispatch**: Direct (inline), Async (queued, re-checked before
//!    execution) and Emergency (boot-time trap only).

pub mod channel;
pub mod check;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod kernel;
pub mod provider;
pub mod registry;
pub mod sched;
pub mod types;

// Re-export key types for convenience
pub use channel::{ChannelHandle, ChannelManager, ChannelState, CloseReason};
pub use check::{AuditLog, CapabilityProof, PermissionEvaluator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::WardenConfig;
pub use dispatch::{AsyncClient, Dispatcher, TRAP_ACQUIRE_INITIAL_CAPABILITIES};
pub use error::{BootstrapError, Error, Result};
pub use id::{CapabilityId, ChannelId, CorrelationId, Epoch, ProcessId, TaskId};
pub use kernel::{CapabilityHandle, Kernel, KernelBuilder, KernelPhase, ShutdownReport};
pub use registry::{Capability, CapabilityRegistry, ProcessCapabilitySet};
pub use sched::{CooperativeScheduler, Scheduler, TokioScheduler, Wakeup};
pub use types::{CapabilityRequest, OperationKind, Payload, Permissions, Request, Response, ResourceKind, Tier};
