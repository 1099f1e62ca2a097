//! Named objects with string contents.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{decode, ensure_kind, Resolved, ServiceProvider};
use crate::check::CapabilityProof;
use crate::error::ServiceError;
use crate::types::{OperationKind, Payload, ResourceHandle, ResourceKind};

#[derive(Debug, Default)]
struct Objects {
    contents: HashMap<u64, String>,
    paths: HashMap<String, u64>,
    next_handle: u64,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    contents: String,
    #[serde(default)]
    append: bool,
}

/// A flat namespace of objects addressed by path.
///
/// Resolving a path that does not exist creates an empty object.
#[derive(Debug, Default)]
pub struct StorageProvider {
    objects: RwLock<Objects>,
}

impl StorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().contents.len()
    }
}

impl ServiceProvider for StorageProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Storage
    }

    fn resolve(&self, descriptor: &str) -> Result<Resolved, ServiceError> {
        let path = descriptor.trim();
        if path.is_empty() {
            return Err(ServiceError::InvalidPayload("empty object path".to_string()));
        }

        let mut objects = self.objects.write();
        if let Some(handle) = objects.paths.get(path) {
            return Ok(Resolved::Existing(ResourceHandle::new(ResourceKind::Storage, *handle)));
        }
        objects.next_handle += 1;
        let handle = objects.next_handle;
        objects.paths.insert(path.to_string(), handle);
        objects.contents.insert(handle, String::new());
        debug!(path, handle, "Created storage object");
        Ok(Resolved::Created(ResourceHandle::new(ResourceKind::Storage, handle)))
    }

    fn handle(
        &self,
        operation: OperationKind,
        proof: &CapabilityProof,
        payload: Payload,
    ) -> Result<Payload, ServiceError> {
        let handle = ensure_kind(proof, ResourceKind::Storage)?;
        let missing = || ServiceError::NotFound(format!("storage object {}", handle));

        match operation {
            OperationKind::Read => {
                let objects = self.objects.read();
                let contents = objects.contents.get(&handle).ok_or_else(missing)?;
                Ok(json!({ "contents": contents }))
            }
            OperationKind::Write => {
                let args: WriteArgs = decode(payload)?;
                let mut objects = self.objects.write();
                let contents = objects.contents.get_mut(&handle).ok_or_else(missing)?;
                if args.append {
                    contents.push_str(&args.contents);
                } else {
                    contents.clone_from(&args.contents);
                }
                Ok(json!({ "size": contents.len() }))
            }
            OperationKind::Delete => {
                let mut objects = self.objects.write();
                objects.contents.remove(&handle).ok_or_else(missing)?;
                objects.paths.retain(|_, h| *h != handle);
                debug!(handle, "Deleted storage object");
                Ok(json!({ "deleted": true }))
            }
            OperationKind::Execute => Err(ServiceError::Unsupported(
                "storage objects cannot be executed".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Permissions;

    #[test]
    fn test_write_append_read() {
        let provider = StorageProvider::new();
        let handle = provider.resolve("/etc/motd").unwrap().handle();
        let proof = CapabilityProof::for_tests(handle, Permissions::READ | Permissions::WRITE);

        provider
            .handle(OperationKind::Write, &proof, json!({ "contents": "hello" }))
            .unwrap();
        let size = provider
            .handle(
                OperationKind::Write,
                &proof,
                json!({ "contents": " world", "append": true }),
            )
            .unwrap();
        assert_eq!(size, json!({ "size": 11 }));

        let read = provider
            .handle(OperationKind::Read, &proof, Payload::Null)
            .unwrap();
        assert_eq!(read, json!({ "contents": "hello world" }));
    }

    #[test]
    fn test_delete_then_resolve_creates_fresh_object() {
        let provider = StorageProvider::new();
        let first = provider.resolve("log").unwrap().handle();
        let proof = CapabilityProof::for_tests(first, Permissions::all());

        provider
            .handle(OperationKind::Delete, &proof, Payload::Null)
            .unwrap();
        let err = provider
            .handle(OperationKind::Read, &proof, Payload::Null)
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let second = provider.resolve("log").unwrap().handle();
        assert_ne!(first, second);
        assert_eq!(provider.object_count(), 1);
    }
}
