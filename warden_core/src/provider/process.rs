//! Program images and the processes spawned from them.
//!
//! Nothing is actually executed: spawning records a process entry that can be
//! inspected, fed input, and killed.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::{decode, ensure_kind, Resolved, ServiceProvider};
use crate::check::CapabilityProof;
use crate::error::ServiceError;
use crate::types::{OperationKind, Payload, ResourceHandle, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnedStatus {
    Running,
    Killed,
}

#[derive(Debug, Clone, Serialize)]
struct Spawned {
    pid: u32,
    program: u64,
    args: Vec<String>,
    status: SpawnedStatus,
    input: Vec<String>,
}

#[derive(Debug, Default)]
struct Table {
    programs: HashMap<u64, String>,
    by_name: HashMap<String, u64>,
    spawned: HashMap<u32, Spawned>,
    next_program: u64,
    next_pid: u32,
}

impl Table {
    fn spawned_mut(&mut self, program: u64, pid: u32) -> Result<&mut Spawned, ServiceError> {
        self.spawned
            .get_mut(&pid)
            .filter(|s| s.program == program)
            .ok_or_else(|| ServiceError::NotFound(format!("process {}", pid)))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteArgs {
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PidArgs {
    pid: u32,
}

#[derive(Debug, Deserialize)]
struct InputArgs {
    pid: u32,
    input: String,
}

/// Spawns bookkeeping-only processes from named program images.
#[derive(Debug, Default)]
pub struct ProcessProvider {
    table: Mutex<Table>,
}

impl ProcessProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> usize {
        self.table
            .lock()
            .spawned
            .values()
            .filter(|s| s.status == SpawnedStatus::Running)
            .count()
    }
}

impl ServiceProvider for ProcessProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Process
    }

    fn resolve(&self, descriptor: &str) -> Result<Resolved, ServiceError> {
        let program = descriptor.trim();
        if program.is_empty() {
            return Err(ServiceError::InvalidPayload("empty program name".to_string()));
        }
        let mut table = self.table.lock();
        if let Some(handle) = table.by_name.get(program) {
            return Ok(Resolved::Existing(ResourceHandle::new(ResourceKind::Process, *handle)));
        }
        table.next_program += 1;
        let handle = table.next_program;
        table.programs.insert(handle, program.to_string());
        table.by_name.insert(program.to_string(), handle);
        Ok(Resolved::Created(ResourceHandle::new(ResourceKind::Process, handle)))
    }

    fn handle(
        &self,
        operation: OperationKind,
        proof: &CapabilityProof,
        payload: Payload,
    ) -> Result<Payload, ServiceError> {
        let program = ensure_kind(proof, ResourceKind::Process)?;
        let mut table = self.table.lock();
        let name = table
            .programs
            .get(&program)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("program {}", program)))?;

        match operation {
            OperationKind::Execute => {
                let args: ExecuteArgs = if payload.is_null() {
                    ExecuteArgs::default()
                } else {
                    decode(payload)?
                };
                table.next_pid += 1;
                let pid = table.next_pid;
                table.spawned.insert(
                    pid,
                    Spawned {
                        pid,
                        program,
                        args: args.args,
                        status: SpawnedStatus::Running,
                        input: Vec::new(),
                    },
                );
                info!(program = %name, pid, "Spawned process");
                Ok(json!({ "pid": pid }))
            }
            OperationKind::Read => {
                let args: PidArgs = decode(payload)?;
                let spawned = table.spawned_mut(program, args.pid)?;
                serde_json::to_value(&*spawned).map_err(|e| ServiceError::Failed(e.to_string()))
            }
            OperationKind::Write => {
                let args: InputArgs = decode(payload)?;
                let spawned = table.spawned_mut(program, args.pid)?;
                if spawned.status != SpawnedStatus::Running {
                    return Err(ServiceError::Failed(format!("process {} is not running", args.pid)));
                }
                let accepted = args.input.len();
                spawned.input.push(args.input);
                Ok(json!({ "accepted": accepted }))
            }
            OperationKind::Delete => {
                let args: PidArgs = decode(payload)?;
                let spawned = table.spawned_mut(program, args.pid)?;
                spawned.status = SpawnedStatus::Killed;
                debug!(program = %name, pid = args.pid, "Killed process");
                Ok(json!({ "killed": args.pid }))
            }
        }
    }
}
