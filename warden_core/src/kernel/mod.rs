//! Kernel lifecycle.
//!
//! The kernel wires the registry, channel manager, providers and dispatcher
//! together, mints boot grants, and owns the phase that gates each tier.

pub mod bootstrap;
pub mod process_table;
pub mod shutdown;


use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandle, ChannelManager, ChannelState};
use crate::check::AuditLog;
use crate::config::WardenConfig;
use crate::dispatch::{AsyncClient, Dispatcher};
use crate::error::{CapabilityError, DispatchError, Result};
use crate::id::{CapabilityId, ChannelId, Epoch, ProcessId};
use crate::provider::ProviderTable;
use crate::registry::{CapabilityRegistry, SweepAttempt};
use crate::sched::TokioScheduler;
use crate::types::{CapabilityRequest, Permissions, ResourceHandle, Tier};

pub use bootstrap::KernelBuilder;
pub use process_table::{ProcessRecord, ProcessStatus, ProcessTable};
pub use shutdown::ShutdownReport;

/// Phase of the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelPhase {
    /// Boot grants are being minted; the emergency path is open.
    #[default]
    Booting,
    Running,
    ShuttingDown,
    ShutDown,
}

/// The current phase, shared by the kernel and the dispatcher.
#[derive(Debug, Default)]
pub struct PhaseCell {
    phase: RwLock<KernelPhase>,
}

impl PhaseCell {
    pub fn get(&self) -> KernelPhase {
        *self.phase.read()
    }

    /// Move `from -> to`, or report the phase actually found.
    pub(crate) fn transition(&self, from: KernelPhase, to: KernelPhase) -> std::result::Result<(), KernelPhase> {
        let mut phase = self.phase.write();
        if *phase != from {
            return Err(*phase);
        }
        *phase = to;
        info!(from = ?from, to = ?to, "Kernel phase changed");
        Ok(())
    }
}

/// What the kernel returns for a minted or delegated capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityHandle {
    pub id: CapabilityId,
    pub resource: ResourceHandle,
    pub tier: Tier,
    pub permissions: Permissions,
    pub epoch: Epoch,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A running capability substrate.
pub struct Kernel {
    config: WardenConfig,
    phase: Arc<PhaseCell>,
    registry: Arc<CapabilityRegistry>,
    channels: Arc<ChannelManager>,
    providers: Arc<ProviderTable>,
    processes: Arc<ProcessTable>,
    dispatcher: Arc<Dispatcher>,
    /// Present when the kernel drives tokio tasks rather than an external scheduler.
    tokio_scheduler: Option<Arc<TokioScheduler>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Kernel {
    pub fn builder(config: WardenConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    pub fn phase(&self) -> KernelPhase {
        self.phase.get()
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn processes(&self) -> &Arc<ProcessTable> {
        &self.processes
    }

    pub fn audit(&self) -> &AuditLog {
        self.channels.audit()
    }

    fn ensure_accepting(&self, caller: ProcessId) -> Result<()> {
        let phase = self.phase.get();
        if matches!(phase, KernelPhase::ShuttingDown | KernelPhase::ShutDown) {
            return Err(DispatchError::NotRunning(phase).into());
        }
        if self.processes.is_terminated(caller) {
            return Err(DispatchError::ProcessTerminated(caller).into());
        }
        Ok(())
    }

    fn ensure_controls(&self, caller: ProcessId, id: &CapabilityId) -> Result<()> {
        if !self.registry.is_controlled_by(id, caller)? {
            return Err(CapabilityError::PermissionDenied(format!(
                "{} does not hold {} or any of its ancestors",
                caller, id
            ))
            .into());
        }
        Ok(())
    }

    fn handle_for(&self, id: CapabilityId) -> Result<CapabilityHandle> {
        let capability = self
            .registry
            .get(&id)
            .ok_or(CapabilityError::NotFound(id))?;
        Ok(CapabilityHandle {
            id,
            resource: capability.resource,
            tier: capability.tier,
            permissions: capability.permissions,
            epoch: capability.epoch,
            expires_at: capability.expires_at,
        })
    }

    /// Mint a root capability over the object `request` names.
    ///
    /// A fresh object belongs to whoever provisions it. Minting over an
    /// object that already exists needs a live GRANT capability over it
    /// covering the requested rights; the kernel needs none.
    ///
    /// The kernel gets Direct capabilities wherever the provider serves that
    /// tier; every other process gets Async ones.
    pub fn request(&self, caller: ProcessId, request: CapabilityRequest) -> Result<CapabilityHandle> {
        self.ensure_accepting(caller)?;
        self.mint_root(caller, caller, request)
    }

    /// Mint for `owner` with the authority of `authority`.
    pub(crate) fn mint_root(
        &self,
        authority: ProcessId,
        owner: ProcessId,
        request: CapabilityRequest,
    ) -> Result<CapabilityHandle> {
        let provider = self
            .providers
            .get(request.kind)
            .ok_or(DispatchError::NoProvider(request.kind))?;
        let resolved = provider.resolve(&request.descriptor)?;
        let resource = resolved.handle();
        if !resolved.is_created()
            && !authority.is_kernel()
            && !self
                .registry
                .holds(authority, &resource, Permissions::GRANT | request.permissions)
        {
            warn!(caller = %authority, resource = %resource, "Refused mint over an existing object");
            return Err(CapabilityError::PermissionDenied(format!(
                "{} holds no grant over {} covering {}",
                authority, resource, request.permissions
            ))
            .into());
        }
        let tier = if owner.is_kernel() && provider.supports_tier(Tier::Direct) {
            Tier::Direct
        } else {
            Tier::Async
        };

        let id = self
            .registry
            .create_with_tier(resource, request.permissions, owner, tier, request.ttl)?;
        self.processes.register(owner, self.registry.clock().now());
        self.handle_for(id)
    }

    /// Delegate `parent` on behalf of a process that controls it.
    pub fn delegate(
        &self,
        caller: ProcessId,
        parent: CapabilityId,
        permissions: Permissions,
        new_owner: ProcessId,
        ttl: Option<chrono::Duration>,
    ) -> Result<CapabilityHandle> {
        self.ensure_accepting(caller)?;
        self.ensure_controls(caller, &parent)?;
        let child = self.registry.delegate(parent, permissions, new_owner, ttl)?;
        self.processes.register(new_owner, self.registry.clock().now());
        self.handle_for(child)
    }

    /// Revoke `id` and its subtree on behalf of a process that controls it.
    pub fn revoke(&self, caller: ProcessId, id: CapabilityId) -> Result<Vec<CapabilityId>> {
        self.ensure_accepting(caller)?;
        self.ensure_controls(caller, &id)?;
        Ok(self.registry.revoke(id)?)
    }

    /// Create and open a channel with the capability's own tier.
    pub fn open_channel(
        &self,
        caller: ProcessId,
        capability: CapabilityId,
        capacity: Option<usize>,
    ) -> Result<ChannelHandle> {
        self.ensure_accepting(caller)?;
        let tier = self
            .registry
            .get(&capability)
            .map(|c| c.tier)
            .ok_or(CapabilityError::NotFound(capability))?;
        let capacity = capacity.unwrap_or_else(|| self.channels.default_capacity());
        let handle = self
            .channels
            .create_channel(caller, capability, tier, capacity)?;
        self.channels.open(caller, handle.id)?;
        Ok(handle)
    }

    pub fn close_channel(&self, caller: ProcessId, channel: ChannelId) -> Result<ChannelState> {
        self.channels.close(caller, channel)
    }

    /// An async client for `channel`, when the kernel runs on tokio.
    pub fn async_client(&self, caller: ProcessId, channel: ChannelId) -> Option<AsyncClient> {
        let scheduler = self.tokio_scheduler.clone()?;
        Some(AsyncClient::new(
            self.dispatcher.clone(),
            scheduler,
            caller,
            channel,
            StdDuration::from_millis(self.config.dispatch.response_timeout_ms),
        ))
    }

    pub fn sweep_expired(&self) -> Vec<CapabilityId> {
        self.registry.sweep_expired()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Run the Tier 2 worker loop until shutdown.
    pub fn spawn_dispatcher(&self) -> JoinHandle<()> {
        tokio::spawn(self.dispatcher.clone().run(self.subscribe_shutdown()))
    }

    /// Sweep expired capabilities every `registry.sweep_interval_ms` until
    /// shutdown.
    ///
    /// With the tokio scheduler a sweep that meets a delegate or revoke in
    /// progress waits for it instead of blocking the worker thread.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let scheduler = self.tokio_scheduler.clone();
        let mut shutdown = self.subscribe_shutdown();
        let period = StdDuration::from_millis(self.config.registry.sweep_interval_ms);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let task = scheduler.as_ref().map(|s| s.register());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => break,
                }
                let swept = match (&scheduler, task) {
                    (Some(scheduler), Some(task)) => loop {
                        match registry.try_sweep_expired(task) {
                            SweepAttempt::Swept(ids) => break ids,
                            SweepAttempt::Suspended => {
                                scheduler.wait(task).await;
                            }
                        }
                    },
                    _ => registry.sweep_expired(),
                };
                if !swept.is_empty() {
                    debug!(count = swept.len(), "Sweeper revoked expired capabilities");
                }
            }
            if let (Some(scheduler), Some(task)) = (scheduler, task) {
                scheduler.unregister(task);
            }
            info!("Sweeper stopped");
        })
    }
}
