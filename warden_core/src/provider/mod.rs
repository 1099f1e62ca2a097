//! Service providers.
//!
//! A provider owns the objects of one resource domain and performs
//! operations on them once the dispatcher has a [`CapabilityProof`]. The
//! dispatcher selects a provider by indexing a fixed table with the
//! capability's [`ResourceKind`].

pub mod memory;
pub mod network;
pub mod process;
pub mod storage;

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::check::CapabilityProof;
use crate::error::ServiceError;
use crate::types::{OperationKind, Payload, ResourceHandle, ResourceKind, Tier};

pub use memory::MemoryProvider;
pub use network::NetworkProvider;
pub use process::ProcessProvider;
pub use storage::StorageProvider;

/// A component that performs operations on one kind of resource.
pub trait ServiceProvider: Send + Sync {
    /// The resource domain this provider serves.
    fn kind(&self) -> ResourceKind;

    /// Whether channels of `tier` may be bound to this provider's resources.
    fn supports_tier(&self, tier: Tier) -> bool {
        tier.is_channel_tier()
    }

    /// Look up or provision the object a capability request names.
    fn resolve(&self, descriptor: &str) -> Result<Resolved, ServiceError>;

    /// Perform `operation`. Never suspends.
    fn handle(
        &self,
        operation: OperationKind,
        proof: &CapabilityProof,
        payload: Payload,
    ) -> Result<Payload, ServiceError>;
}

/// Outcome of resolving a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// Provisioned by this call.
    Created(ResourceHandle),
    /// Already existed, so someone else may hold capabilities over it.
    Existing(ResourceHandle),
}

impl Resolved {
    pub fn handle(self) -> ResourceHandle {
        match self {
            Resolved::Created(handle) | Resolved::Existing(handle) => handle,
        }
    }

    pub fn is_created(self) -> bool {
        matches!(self, Resolved::Created(_))
    }
}

/// Providers indexed by resource kind.
#[derive(Clone, Default)]
pub struct ProviderTable {
    slots: [Option<Arc<dyn ServiceProvider>>; ResourceKind::COUNT],
}

impl ProviderTable {
    /// A table with no providers installed.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A table with the in-memory reference providers for every kind.
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        table.register(Arc::new(MemoryProvider::new()));
        table.register(Arc::new(StorageProvider::new()));
        table.register(Arc::new(ProcessProvider::new()));
        table.register(Arc::new(NetworkProvider::new()));
        table
    }

    /// Install a provider, returning the one it replaced.
    pub fn register(&mut self, provider: Arc<dyn ServiceProvider>) -> Option<Arc<dyn ServiceProvider>> {
        let idx = provider.kind().index();
        self.slots[idx].replace(provider)
    }

    pub fn get(&self, kind: ResourceKind) -> Option<&Arc<dyn ServiceProvider>> {
        self.slots[kind.index()].as_ref()
    }

    pub fn supports(&self, kind: ResourceKind, tier: Tier) -> bool {
        self.get(kind).map_or(false, |p| p.supports_tier(tier))
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .filter(|k| self.get(*k).is_some())
            .collect()
    }
}

/// Decode a payload into the argument struct an operation expects.
pub(crate) fn decode<T: DeserializeOwned>(payload: Payload) -> Result<T, ServiceError> {
    serde_json::from_value(payload).map_err(|e| ServiceError::InvalidPayload(e.to_string()))
}

/// Reject proofs minted for another provider's resources.
pub(crate) fn ensure_kind(proof: &CapabilityProof, kind: ResourceKind) -> Result<u64, ServiceError> {
    let resource = proof.resource();
    if resource.kind != kind {
        return Err(ServiceError::Unsupported(format!(
            "{} provider cannot serve {}",
            kind, resource
        )));
    }
    Ok(resource.handle)
}
