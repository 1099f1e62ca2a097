//! Requests, responses and capability requests.

use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::{Permissions, ResourceKind};
use crate::error::Error;
use crate::id::CorrelationId;

/// Opaque request/response body handed to providers.
pub type Payload = serde_json::Value;

/// Operation a request performs on the resource behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Read,
    Write,
    Execute,
    Delete,
}

impl OperationKind {
    /// The permission bit a capability must hold to perform this operation.
    pub fn required_permission(self) -> Permissions {
        match self {
            OperationKind::Read => Permissions::READ,
            OperationKind::Write => Permissions::WRITE,
            OperationKind::Execute => Permissions::EXECUTE,
            OperationKind::Delete => Permissions::DELETE,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Execute => "execute",
            OperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A queued invocation on an Async channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub correlation: CorrelationId,
    pub operation: OperationKind,
    pub payload: Payload,
}

impl Request {
    pub fn new(correlation: impl Into<CorrelationId>, operation: OperationKind, payload: Payload) -> Self {
        Self {
            correlation: correlation.into(),
            operation,
            payload,
        }
    }
}

/// The outcome of a request, tagged with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub correlation: CorrelationId,
    pub result: Result<Payload, Error>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// What a process asks the kernel for when it wants a new root capability.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityRequest {
    pub kind: ResourceKind,
    /// Provider-specific name of the object (region name, object path, endpoint).
    pub descriptor: String,
    pub permissions: Permissions,
    /// Lifetime from the moment of minting. `None` never expires.
    pub ttl: Option<Duration>,
}

impl CapabilityRequest {
    pub fn new(kind: ResourceKind, descriptor: impl Into<String>, permissions: Permissions) -> Self {
        Self {
            kind,
            descriptor: descriptor.into(),
            permissions,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}
