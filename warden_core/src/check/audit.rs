//! Capability check auditing.
//!
//! Every check the dispatcher performs is recorded here, keyed by capability.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::evaluator::{Decision, DenyReason};
use crate::id::{CapabilityId, ProcessId};
use crate::types::Permissions;

/// Point in the invocation path where a check happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStage {
    /// Tier 1 inline check.
    Direct,
    /// Tier 2 check when the request is queued.
    Enqueue,
    /// Tier 2 re-check right before the provider runs.
    PreExecute,
}

/// An audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the check ran.
    pub timestamp: DateTime<Utc>,

    /// The capability that was checked.
    pub capability: CapabilityId,

    /// The process that presented it.
    pub caller: ProcessId,

    /// The permission that was requested.
    pub requested: Permissions,

    pub stage: CheckStage,

    /// Why the check failed, if it did.
    pub denied: Option<DenyReason>,
}

impl AuditEntry {
    pub fn allowed(&self) -> bool {
        self.denied.is_none()
    }
}

/// Default number of capabilities an audit log tracks at once.
pub const DEFAULT_MAX_CAPABILITIES: usize = 4096;

/// An audit log.
#[derive(Clone)]
pub struct AuditLog {
    /// The audit entries.
    entries: Arc<DashMap<CapabilityId, Vec<AuditEntry>>>,

    /// Capabilities in the order they were first recorded.
    order: Arc<Mutex<VecDeque<CapabilityId>>>,

    /// The maximum number of entries to keep per capability.
    max_entries_per_capability: usize,

    /// The maximum number of capabilities to keep entries for.
    max_capabilities: usize,
}

impl AuditLog {
    /// Create a new audit log.
    ///
    /// # Arguments
    ///
    /// * `max_entries_per_capability` - The maximum number of entries to keep per capability.
    pub fn new(max_entries_per_capability: usize) -> Self {
        Self::bounded(max_entries_per_capability, DEFAULT_MAX_CAPABILITIES)
    }

    /// Create an audit log that also caps how many capabilities it tracks.
    ///
    /// When a new capability would exceed `max_capabilities`, the entries of
    /// the capability recorded first are dropped.
    pub fn bounded(max_entries_per_capability: usize, max_capabilities: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            order: Arc::new(Mutex::new(VecDeque::new())),
            max_entries_per_capability,
            max_capabilities: max_capabilities.max(1),
        }
    }

    /// Record the outcome of a check.
    pub fn record(
        &self,
        timestamp: DateTime<Utc>,
        capability: CapabilityId,
        caller: ProcessId,
        requested: Permissions,
        stage: CheckStage,
        decision: Decision,
    ) {
        let entry = AuditEntry {
            timestamp,
            capability,
            caller,
            requested,
            stage,
            denied: match decision {
                Decision::Allow => None,
                Decision::Deny(reason) => Some(reason),
            },
        };

        let is_new = match self.entries.entry(capability) {
            Entry::Occupied(mut occupied) => {
                let entries = occupied.get_mut();
                entries.push(entry);

                // Trim the log if necessary
                if entries.len() > self.max_entries_per_capability {
                    let to_remove = entries.len() - self.max_entries_per_capability;
                    entries.drain(0..to_remove);
                }
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(vec![entry]);
                true
            }
        };

        if is_new {
            self.evict_beyond_capacity(capability);
        }
    }

    /// Track a newly recorded capability and drop the oldest ones over the cap.
    fn evict_beyond_capacity(&self, capability: CapabilityId) {
        let mut order = self.order.lock();
        order.push_back(capability);
        while order.len() > self.max_capabilities {
            if let Some(oldest) = order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    /// Number of capabilities with recorded entries.
    pub fn capability_count(&self) -> usize {
        self.entries.len()
    }

    /// Get the audit entries for a capability, oldest first.
    pub fn entries(&self, capability: &CapabilityId) -> Vec<AuditEntry> {
        self.entries
            .get(capability)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    /// Number of denials recorded for a capability.
    pub fn denials(&self, capability: &CapabilityId) -> usize {
        self.entries
            .get(capability)
            .map(|entries| entries.iter().filter(|e| !e.allowed()).count())
            .unwrap_or(0)
    }

    /// Clear the audit entries for a capability.
    pub fn clear(&self, capability: &CapabilityId) {
        self.order.lock().retain(|c| c != capability);
        self.entries.remove(capability);
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(1000)
    }
}
