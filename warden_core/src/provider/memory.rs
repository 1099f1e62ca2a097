//! In-memory regions.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{decode, ensure_kind, Resolved, ServiceProvider};
use crate::check::CapabilityProof;
use crate::error::ServiceError;
use crate::types::{OperationKind, Payload, ResourceHandle, ResourceKind};

/// Size of a region when the descriptor does not give one.
pub const DEFAULT_REGION_SIZE: usize = 4096;

/// Largest region a descriptor may ask for.
pub const MAX_REGION_SIZE: usize = 1 << 20;

#[derive(Debug)]
struct Region {
    name: String,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct Regions {
    by_handle: HashMap<u64, Region>,
    by_name: HashMap<String, u64>,
    next_handle: u64,
}

impl Regions {
    fn region_mut(&mut self, handle: u64) -> Result<&mut Region, ServiceError> {
        self.by_handle
            .get_mut(&handle)
            .ok_or_else(|| ServiceError::NotFound(format!("memory region {}", handle)))
    }
}

#[derive(Debug, Deserialize)]
struct ReadArgs {
    #[serde(default)]
    offset: usize,
    len: usize,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    #[serde(default)]
    offset: usize,
    data: Vec<u8>,
}

/// Fixed-size byte regions named by `name` or `name:size` descriptors.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    regions: Mutex<Regions>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().by_handle.len()
    }
}

fn parse_descriptor(descriptor: &str) -> Result<(&str, usize), ServiceError> {
    match descriptor.split_once(':') {
        None => Ok((descriptor, DEFAULT_REGION_SIZE)),
        Some((name, size)) => {
            let size = size
                .parse::<usize>()
                .map_err(|_| ServiceError::InvalidPayload(format!("bad region size '{}'", size)))?;
            if size > MAX_REGION_SIZE {
                return Err(ServiceError::InvalidPayload(format!(
                    "region size {} exceeds {} bytes",
                    size, MAX_REGION_SIZE
                )));
            }
            Ok((name, size))
        }
    }
}

fn bounds(offset: usize, len: usize, size: usize) -> Result<std::ops::Range<usize>, ServiceError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(ServiceError::Failed(format!(
            "range {}+{} outside region of {} bytes",
            offset, len, size
        ))),
    }
}

impl ServiceProvider for MemoryProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Memory
    }

    fn resolve(&self, descriptor: &str) -> Result<Resolved, ServiceError> {
        let (name, size) = parse_descriptor(descriptor)?;
        if name.is_empty() || size == 0 {
            return Err(ServiceError::InvalidPayload(format!(
                "bad region descriptor '{}'",
                descriptor
            )));
        }

        let mut regions = self.regions.lock();
        if let Some(handle) = regions.by_name.get(name) {
            return Ok(Resolved::Existing(ResourceHandle::new(ResourceKind::Memory, *handle)));
        }
        regions.next_handle += 1;
        let handle = regions.next_handle;
        regions.by_name.insert(name.to_string(), handle);
        regions.by_handle.insert(
            handle,
            Region {
                name: name.to_string(),
                bytes: vec![0; size],
            },
        );
        debug!(region = name, handle, size, "Provisioned memory region");
        Ok(Resolved::Created(ResourceHandle::new(ResourceKind::Memory, handle)))
    }

    fn handle(
        &self,
        operation: OperationKind,
        proof: &CapabilityProof,
        payload: Payload,
    ) -> Result<Payload, ServiceError> {
        let handle = ensure_kind(proof, ResourceKind::Memory)?;
        let mut regions = self.regions.lock();

        match operation {
            OperationKind::Read => {
                let args: ReadArgs = decode(payload)?;
                let region = regions.region_mut(handle)?;
                let range = bounds(args.offset, args.len, region.bytes.len())?;
                Ok(json!({ "data": region.bytes[range].to_vec() }))
            }
            OperationKind::Write => {
                let args: WriteArgs = decode(payload)?;
                let region = regions.region_mut(handle)?;
                let range = bounds(args.offset, args.data.len(), region.bytes.len())?;
                region.bytes[range].copy_from_slice(&args.data);
                Ok(json!({ "written": args.data.len() }))
            }
            OperationKind::Execute => Err(ServiceError::Unsupported(
                "memory regions are not executable here".to_string(),
            )),
            OperationKind::Delete => {
                let region = regions
                    .by_handle
                    .remove(&handle)
                    .ok_or_else(|| ServiceError::NotFound(format!("memory region {}", handle)))?;
                regions.by_name.remove(&region.name);
                debug!(region = %region.name, handle, "Freed memory region");
                Ok(json!({ "freed": region.bytes.len() }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Permissions;

    fn proof(handle: ResourceHandle) -> CapabilityProof {
        CapabilityProof::for_tests(handle, Permissions::all())
    }

    #[test]
    fn test_resolve_is_idempotent_per_name() {
        let provider = MemoryProvider::new();
        let a = provider.resolve("scratch:64").unwrap();
        let b = provider.resolve("scratch").unwrap();
        assert!(a.is_created());
        assert_eq!(b, Resolved::Existing(a.handle()));
        assert_eq!(provider.region_count(), 1);
        assert!(provider.resolve("bad:size").is_err());
        assert!(provider.resolve("zero:0").is_err());
    }

    #[test]
    fn test_region_size_is_capped() {
        let provider = MemoryProvider::new();
        let err = provider.resolve("big:18446744073709551615").unwrap_err();
        assert!(matches!(err, ServiceError::InvalidPayload(_)));
        let err = provider
            .resolve(&format!("big:{}", MAX_REGION_SIZE + 1))
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidPayload(_)));
        assert_eq!(provider.region_count(), 0);

        let edge = provider
            .resolve(&format!("edge:{}", MAX_REGION_SIZE))
            .unwrap();
        assert!(edge.is_created());
    }

    #[test]
    fn test_write_then_read() {
        let provider = MemoryProvider::new();
        let handle = provider.resolve("buf:16").unwrap().handle();
        let proof = proof(handle);

        let written = provider
            .handle(OperationKind::Write, &proof, json!({ "offset": 4, "data": [1, 2, 3] }))
            .unwrap();
        assert_eq!(written, json!({ "written": 3 }));

        let read = provider
            .handle(OperationKind::Read, &proof, json!({ "offset": 3, "len": 5 }))
            .unwrap();
        assert_eq!(read, json!({ "data": [0, 1, 2, 3, 0] }));
    }

    #[test]
    fn test_out_of_bounds_and_bad_payload() {
        let provider = MemoryProvider::new();
        let proof = proof(provider.resolve("buf:8").unwrap().handle());

        let err = provider
            .handle(OperationKind::Read, &proof, json!({ "offset": 6, "len": 4 }))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Failed(_)));

        let err = provider
            .handle(OperationKind::Write, &proof, json!({ "bytes": "nope" }))
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidPayload(_)));
    }

    #[test]
    fn test_delete_frees_region() {
        let provider = MemoryProvider::new();
        let proof = proof(provider.resolve("tmp:32").unwrap().handle());

        let freed = provider
            .handle(OperationKind::Delete, &proof, Payload::Null)
            .unwrap();
        assert_eq!(freed, json!({ "freed": 32 }));
        assert_eq!(provider.region_count(), 0);

        let err = provider
            .handle(OperationKind::Read, &proof, json!({ "len": 1 }))
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[test]
    fn test_rejects_foreign_proofs() {
        let provider = MemoryProvider::new();
        let foreign = proof(ResourceHandle::new(ResourceKind::Storage, 1));
        let err = provider
            .handle(OperationKind::Read, &foreign, json!({ "len": 1 }))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unsupported(_)));
    }
}
