//! Loopback datagram endpoints.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use super::{decode, ensure_kind, Resolved, ServiceProvider};
use crate::check::CapabilityProof;
use crate::error::ServiceError;
use crate::types::{OperationKind, Payload, ResourceHandle, ResourceKind, Tier};

/// Datagrams an endpoint buffers before writes fail.
pub const ENDPOINT_BUFFER: usize = 256;

#[derive(Debug, Default)]
struct Endpoints {
    buffers: HashMap<u64, VecDeque<String>>,
    by_name: HashMap<String, u64>,
    next_handle: u64,
}

#[derive(Debug, Deserialize)]
struct SendArgs {
    datagram: String,
}

/// Endpoints that deliver written datagrams back to readers in order.
///
/// Network I/O may block on real hardware, so only Async channels are served.
#[derive(Debug, Default)]
pub struct NetworkProvider {
    endpoints: Mutex<Endpoints>,
}

impl NetworkProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceProvider for NetworkProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    fn supports_tier(&self, tier: Tier) -> bool {
        tier == Tier::Async
    }

    fn resolve(&self, descriptor: &str) -> Result<Resolved, ServiceError> {
        let name = descriptor.trim();
        if name.is_empty() {
            return Err(ServiceError::InvalidPayload("empty endpoint name".to_string()));
        }
        let mut endpoints = self.endpoints.lock();
        if let Some(handle) = endpoints.by_name.get(name) {
            return Ok(Resolved::Existing(ResourceHandle::new(ResourceKind::Network, *handle)));
        }
        endpoints.next_handle += 1;
        let handle = endpoints.next_handle;
        endpoints.by_name.insert(name.to_string(), handle);
        endpoints.buffers.insert(handle, VecDeque::new());
        Ok(Resolved::Created(ResourceHandle::new(ResourceKind::Network, handle)))
    }

    fn handle(
        &self,
        operation: OperationKind,
        proof: &CapabilityProof,
        payload: Payload,
    ) -> Result<Payload, ServiceError> {
        let handle = ensure_kind(proof, ResourceKind::Network)?;
        let mut endpoints = self.endpoints.lock();
        let buffer = endpoints
            .buffers
            .get_mut(&handle)
            .ok_or_else(|| ServiceError::NotFound(format!("endpoint {}", handle)))?;

        match operation {
            OperationKind::Write => {
                let args: SendArgs = decode(payload)?;
                if buffer.len() >= ENDPOINT_BUFFER {
                    return Err(ServiceError::Failed(format!("endpoint {} buffer full", handle)));
                }
                buffer.push_back(args.datagram);
                Ok(json!({ "queued": buffer.len() }))
            }
            OperationKind::Read => Ok(json!({ "datagram": buffer.pop_front() })),
            other => Err(ServiceError::Unsupported(format!("{} on a network endpoint", other))),
        }
    }
}
