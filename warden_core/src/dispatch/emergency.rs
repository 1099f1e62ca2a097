//! Tier 3: the emergency trap.
//!
//! A process uses the trap exactly once, during boot, to learn the
//! capabilities it was started with. After the kernel starts the path is
//! sealed unless the debug switch is on, and any misuse terminates the caller.

use tracing::{error, info};

use super::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::id::ProcessId;
use crate::kernel::KernelPhase;
use crate::registry::ProcessCapabilitySet;

/// Fetch the caller's initial capability set.
pub const TRAP_ACQUIRE_INITIAL_CAPABILITIES: u32 = 0x01;

impl Dispatcher {
    /// Handle a trap from `pid`.
    pub fn trap(&self, pid: ProcessId, code: u32) -> Result<ProcessCapabilitySet> {
        if self.processes.is_terminated(pid) {
            return Err(DispatchError::ProcessTerminated(pid).into());
        }

        let phase = self.phase.get();
        let open = phase == KernelPhase::Booting || self.emergency_debug;
        if !open {
            return Err(self.violation(pid, format!("trap {:#04x} after boot ({:?})", code, phase)));
        }
        if code != TRAP_ACQUIRE_INITIAL_CAPABILITIES {
            return Err(self.violation(pid, format!("unknown trap code {:#04x}", code)));
        }

        let now = self.registry.clock().now();
        let mut set = ProcessCapabilitySet::new(pid);
        set.extend(
            self.processes
                .initial_capabilities(pid)
                .iter()
                .filter_map(|id| self.registry.get(id))
                .filter(|c| c.is_live_at(now)),
        );
        info!(pid = %pid, count = set.len(), "Handed out initial capabilities");
        Ok(set)
    }

    /// Terminate the offender and revoke everything it holds.
    fn violation(&self, pid: ProcessId, reason: String) -> crate::error::Error {
        error!(pid = %pid, reason = %reason, "Emergency path protocol violation");
        if !pid.is_kernel() {
            let now = self.registry.clock().now();
            if self.processes.terminate(pid, reason.clone(), now) {
                self.registry.revoke_owned_by(pid);
            }
        }
        DispatchError::ProtocolViolation(reason).into()
    }
}
