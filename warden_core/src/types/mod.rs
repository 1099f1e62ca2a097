//! Core value types shared by every component.

pub mod permission;
pub mod request;
pub mod resource;
pub mod tier;

pub use permission::Permissions;
pub use request::{CapabilityRequest, OperationKind, Payload, Request, Response};
pub use resource::{ResourceHandle, ResourceKind};
pub use tier::Tier;
