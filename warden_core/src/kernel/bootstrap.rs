//! Kernel bootstrap.
//!
//! `build()` assembles the components and mints boot grants while the kernel
//! is still `Booting`; `start()` seals the emergency path and opens Tiers 1
//! and 2.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use super::{Kernel, KernelPhase, PhaseCell, ProcessTable};
use crate::channel::ChannelManager;
use crate::check::AuditLog;
use crate::clock::{Clock, SystemClock};
use crate::config::{BootGrant, WardenConfig};
use crate::dispatch::Dispatcher;
use crate::error::BootstrapError;
use crate::id::ProcessId;
use crate::provider::ProviderTable;
use crate::registry::{CapabilityRegistry, RevocationListener};
use crate::sched::{Scheduler, TokioScheduler};
use crate::types::CapabilityRequest;

/// Assembles a [`Kernel`].
pub struct KernelBuilder {
    config: WardenConfig,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    providers: Option<ProviderTable>,
}

impl KernelBuilder {
    pub fn new(config: WardenConfig) -> Self {
        Self {
            config,
            clock: None,
            scheduler: None,
            providers: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Drive suspensions through an external scheduler instead of tokio.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn providers(mut self, providers: ProviderTable) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Build the kernel and mint the configured boot grants.
    ///
    /// The kernel is left in [`KernelPhase::Booting`].
    pub fn build(self) -> Result<Arc<Kernel>, BootstrapError> {
        let config = self.config;
        config.validate()?;
        info!("Bootstrapping kernel");

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let mut tokio_scheduler = None;
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => {
                let tokio = Arc::new(TokioScheduler::new());
                tokio_scheduler = Some(tokio.clone());
                tokio
            }
        };
        let providers = Arc::new(self.providers.unwrap_or_else(ProviderTable::with_defaults));

        let registry = Arc::new(CapabilityRegistry::new(clock, scheduler.clone()));
        let channels = Arc::new(ChannelManager::new(
            registry.clone(),
            providers.clone(),
            scheduler,
            AuditLog::bounded(
                config.registry.audit_max_entries,
                config.registry.audit_max_capabilities,
            ),
            config.channels.clone(),
        ));
        let listener: Arc<dyn RevocationListener> = channels.clone();
        registry.add_listener(Arc::downgrade(&listener));

        let processes = Arc::new(ProcessTable::new());
        let phase = Arc::new(PhaseCell::default());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            channels.clone(),
            providers.clone(),
            processes.clone(),
            phase.clone(),
            config.emergency.debug,
        ));
        let (shutdown_tx, _) = broadcast::channel(4);

        let kernel = Kernel {
            config,
            phase,
            registry,
            channels,
            providers,
            processes,
            dispatcher,
            tokio_scheduler,
            shutdown_tx,
        };
        for grant in &kernel.config.boot.grants {
            kernel.mint_boot_grant(grant)?;
        }
        info!(
            providers = ?kernel.providers.kinds(),
            grants = kernel.config.boot.grants.len(),
            "Kernel built"
        );
        Ok(Arc::new(kernel))
    }
}

impl Kernel {
    fn mint_boot_grant(&self, grant: &BootGrant) -> Result<(), BootstrapError> {
        let owner = grant.owner();
        let mut request = CapabilityRequest::new(grant.kind()?, grant.descriptor.clone(), grant.permissions()?);
        request.ttl = grant.ttl();

        let handle = self
            .mint_root(ProcessId::KERNEL, owner, request)
            .map_err(|source| BootstrapError::Grant { owner, source })?;
        self.processes
            .record_initial(owner, handle.id, self.registry.clock().now());
        info!(
            owner = %owner,
            capability = %handle.id,
            resource = %handle.resource,
            "Minted boot grant"
        );
        Ok(())
    }

    /// `Booting -> Running`.
    pub fn start(&self) -> Result<(), BootstrapError> {
        self.phase
            .transition(KernelPhase::Booting, KernelPhase::Running)
            .map_err(BootstrapError::WrongPhase)?;
        info!(debug_emergency = self.config.emergency.debug, "Kernel running");
        Ok(())
    }
}
