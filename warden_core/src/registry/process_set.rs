//! Per-process view of held capabilities.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::record::Capability;
use crate::id::{CapabilityId, ProcessId};

/// The live capabilities a process owns at one instant.
///
/// A process may only name capabilities that appear in its set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCapabilitySet {
    pub owner: ProcessId,
    pub capabilities: HashMap<CapabilityId, Capability>,
}

impl ProcessCapabilitySet {
    pub fn new(owner: ProcessId) -> Self {
        Self {
            owner,
            capabilities: HashMap::new(),
        }
    }

    pub fn contains(&self, id: &CapabilityId) -> bool {
        self.capabilities.contains_key(id)
    }

    pub fn get(&self, id: &CapabilityId) -> Option<&Capability> {
        self.capabilities.get(id)
    }

    pub fn ids(&self) -> Vec<CapabilityId> {
        self.capabilities.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl Extend<Capability> for ProcessCapabilitySet {
    fn extend<T: IntoIterator<Item = Capability>>(&mut self, iter: T) {
        for capability in iter {
            self.capabilities.insert(capability.id, capability);
        }
    }
}
