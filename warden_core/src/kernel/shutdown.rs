//! Kernel shutdown.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Kernel, KernelPhase};
use crate::channel::ChannelState;
use crate::error::BootstrapError;

/// What shutdown tore down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Capabilities that were still live and got revoked.
    pub revoked: usize,
    /// Of those, channels in `Closed` once shutdown finished.
    pub channels_closed: usize,
    /// Channels that existed when shutdown began.
    pub channels_total: usize,
}

impl Kernel {
    /// Stop the worker loops and revoke every outstanding capability.
    ///
    /// Revocation force-closes every channel still open, which resumes any
    /// task parked on one.
    pub fn shutdown(&self) -> Result<ShutdownReport, BootstrapError> {
        let from = self.phase.get();
        if matches!(from, KernelPhase::ShuttingDown | KernelPhase::ShutDown) {
            return Err(BootstrapError::WrongPhase(from));
        }
        self.phase
            .transition(from, KernelPhase::ShuttingDown)
            .map_err(BootstrapError::WrongPhase)?;

        info!("Phase A: signalling worker loops to stop");
        if self.shutdown_tx.send(()).is_err() {
            warn!("No worker loops were listening for shutdown");
        }

        info!("Phase B: revoking outstanding capabilities");
        let channels = self.channels.list();
        let revoked = self.registry.revoke_all().len();

        // A channel too old to have a tombstone was destroyed, so it counts as closed.
        let channels_closed = channels
            .iter()
            .filter(|id| {
                self.channels
                    .state(**id)
                    .map_or(true, ChannelState::is_closed)
            })
            .count();

        self.phase
            .transition(KernelPhase::ShuttingDown, KernelPhase::ShutDown)
            .map_err(BootstrapError::WrongPhase)?;

        let report = ShutdownReport {
            revoked,
            channels_closed,
            channels_total: channels.len(),
        };
        info!(
            revoked = report.revoked,
            channels_closed = report.channels_closed,
            "Kernel shut down"
        );
        Ok(report)
    }
}
