//! Permission checking and auditing.

pub mod audit;
pub mod evaluator;

pub use audit::{AuditEntry, AuditLog, CheckStage};
pub use evaluator::{CapabilityProof, Decision, DenyReason, PermissionEvaluator};
