//! Processes known to the kernel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::id::{CapabilityId, ProcessId};

/// Lifecycle of a process as the kernel sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Terminated { reason: String, at: DateTime<Utc> },
}

/// Kernel bookkeeping for one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: ProcessId,
    pub status: ProcessStatus,
    /// Capabilities granted at boot, handed out by the emergency trap.
    pub initial: Vec<CapabilityId>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: DashMap<ProcessId, ProcessRecord>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pid` if it is not known yet.
    pub fn register(&self, pid: ProcessId, now: DateTime<Utc>) {
        self.processes.entry(pid).or_insert_with(|| ProcessRecord {
            pid,
            status: ProcessStatus::Running,
            initial: Vec::new(),
            registered_at: now,
        });
    }

    /// Append a boot grant to the process's initial set.
    pub fn record_initial(&self, pid: ProcessId, capability: CapabilityId, now: DateTime<Utc>) {
        self.register(pid, now);
        if let Some(mut record) = self.processes.get_mut(&pid) {
            record.initial.push(capability);
        }
    }

    pub fn initial_capabilities(&self, pid: ProcessId) -> Vec<CapabilityId> {
        self.processes
            .get(&pid)
            .map(|r| r.initial.clone())
            .unwrap_or_default()
    }

    /// Mark `pid` terminated. Returns `false` if it already was.
    pub fn terminate(&self, pid: ProcessId, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        self.register(pid, now);
        let Some(mut record) = self.processes.get_mut(&pid) else {
            return false;
        };
        if matches!(record.status, ProcessStatus::Terminated { .. }) {
            warn!(pid = %pid, "Process already terminated");
            return false;
        }
        let reason = reason.into();
        info!(pid = %pid, reason = %reason, "Process terminated");
        record.status = ProcessStatus::Terminated { reason, at: now };
        true
    }

    pub fn is_terminated(&self, pid: ProcessId) -> bool {
        self.processes
            .get(&pid)
            .map_or(false, |r| matches!(r.status, ProcessStatus::Terminated { .. }))
    }

    pub fn get(&self, pid: ProcessId) -> Option<ProcessRecord> {
        self.processes.get(&pid).map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<ProcessId> {
        let mut pids: Vec<ProcessId> = self.processes.iter().map(|r| *r.key()).collect();
        pids.sort();
        pids
    }
}
