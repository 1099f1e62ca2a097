//! Command implementations.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use warden_core::config::BootGrant;
use warden_core::{
    AsyncClient, CapabilityRequest, Kernel, OperationKind, Permissions, ProcessId, ResourceKind, ShutdownReport,
    WardenConfig, TRAP_ACQUIRE_INITIAL_CAPABILITIES,
};

use crate::error::CliError;

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn client_for(kernel: &Kernel, caller: ProcessId, channel: warden_core::ChannelId) -> Result<AsyncClient, CliError> {
    kernel
        .async_client(caller, channel)
        .ok_or_else(|| CliError::Demo("kernel was built without the tokio scheduler".to_string()))
}

/// Render a memory read as text.
fn as_text(read: &Value) -> String {
    let bytes: Vec<u8> = serde_json::from_value(read["data"].clone()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Walk through every tier, delegation, revocation and shutdown.
pub async fn demo() -> Result<(), CliError> {
    let shell = ProcessId(1);
    let viewer = ProcessId(2);

    let mut config = WardenConfig::default();
    config.boot.grants = vec![BootGrant {
        owner: shell.0,
        kind: "memory".to_string(),
        descriptor: "shell:32".to_string(),
        permissions: vec!["read".to_string(), "write".to_string(), "delegate".to_string()],
        ttl_secs: None,
    }];
    let kernel = Kernel::builder(config).build()?;

    println!("== Emergency trap during boot");
    let initial = kernel
        .dispatcher()
        .trap(shell, TRAP_ACQUIRE_INITIAL_CAPABILITIES)?;
    print_json(&initial)?;
    let boot_cap = initial
        .ids()
        .into_iter()
        .next()
        .ok_or_else(|| CliError::Demo("boot grant missing".to_string()))?;

    kernel.start()?;
    let worker = kernel.spawn_dispatcher();

    println!("== Direct invocation by the kernel");
    let kcap = kernel.request(
        ProcessId::KERNEL,
        CapabilityRequest::new(ResourceKind::Memory, "kernel-scratch:16", Permissions::READ | Permissions::WRITE),
    )?;
    let kch = kernel.open_channel(ProcessId::KERNEL, kcap.id, None)?;
    kernel.dispatcher().invoke_direct(
        ProcessId::KERNEL,
        kch.id,
        OperationKind::Write,
        json!({ "data": b"warden" }),
    )?;
    let read = kernel
        .dispatcher()
        .invoke_direct(ProcessId::KERNEL, kch.id, OperationKind::Read, json!({ "len": 6 }))?;
    println!("kernel read {:?} over a {} channel", as_text(&read), kch.tier);

    println!("== Async channel");
    let ch = kernel.open_channel(shell, boot_cap, None)?;
    let client = client_for(&kernel, shell, ch.id)?;
    client
        .call(OperationKind::Write, json!({ "data": b"hello" }))
        .await?;
    let read = client.call(OperationKind::Read, json!({ "len": 5 })).await?;
    println!("shell read {:?} over a {} channel", as_text(&read), ch.tier);

    println!("== Delegation and revocation");
    let child = kernel.delegate(shell, boot_cap, Permissions::READ, viewer, None)?;
    let vch = kernel.open_channel(viewer, child.id, None)?;
    let viewer_client = client_for(&kernel, viewer, vch.id)?;
    let read = viewer_client
        .call(OperationKind::Read, json!({ "len": 5 }))
        .await?;
    println!("viewer read {:?} through a delegated capability", as_text(&read));

    match viewer_client
        .call(OperationKind::Write, json!({ "data": b"nope" }))
        .await
    {
        Err(e) => println!("viewer write refused: {}", e),
        Ok(_) => return Err(CliError::Demo("read-only delegate wrote".to_string())),
    }

    let revoked = kernel.revoke(shell, child.id)?;
    println!("revoked {} capability(ies)", revoked.len());
    match viewer_client
        .call(OperationKind::Read, json!({ "len": 5 }))
        .await
    {
        Err(e) if e.is_revoked() => println!("viewer after revocation: {}", e),
        other => return Err(CliError::Demo(format!("expected revocation, got {:?}", other))),
    }

    println!("== Emergency trap after boot");
    match kernel
        .dispatcher()
        .trap(shell, TRAP_ACQUIRE_INITIAL_CAPABILITIES)
    {
        Err(e) if e.is_fatal() => println!("shell terminated: {}", e),
        other => return Err(CliError::Demo(format!("expected a protocol violation, got {:?}", other))),
    }

    println!("== Shutdown");
    let report = kernel.shutdown()?;
    print_json(&report)?;
    worker.await?;
    Ok(())
}

/// Outcome of racing a revocation against queued requests.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RaceSummary {
    pub requests: usize,
    /// Responses delivered before the revocation.
    pub completed: usize,
    /// Requests that observed the revocation instead.
    pub denied: usize,
    /// Pre-execution denials in the audit log.
    ///
    /// Varies between runs: it counts only requests the dispatcher had
    /// already dequeued when the revocation landed. Never exceeds `denied`.
    pub audited_denials: usize,
}

/// Queue `requests` writes, revoke the capability once the first response
/// is in, and report what every request saw.
pub async fn revoke_race(requests: usize) -> Result<RaceSummary, CliError> {
    if requests == 0 {
        return Err(CliError::Demo("need at least one request".to_string()));
    }
    let owner = ProcessId(1);
    let kernel = Kernel::builder(WardenConfig::default()).build()?;
    kernel.start()?;

    let cap = kernel.request(
        owner,
        CapabilityRequest::new(
            ResourceKind::Memory,
            format!("race:{}", requests),
            Permissions::READ | Permissions::WRITE,
        ),
    )?;
    let ch = kernel.open_channel(owner, cap.id, Some(requests))?;
    let client = Arc::new(client_for(&kernel, owner, ch.id)?);

    let mut correlations = Vec::with_capacity(requests);
    for i in 0..requests {
        let payload = json!({ "offset": i, "data": [(i % 256) as u8] });
        correlations.push(client.send(OperationKind::Write, payload).await?);
    }
    info!(requests, "Queued requests before starting the dispatcher");

    let worker = kernel.spawn_dispatcher();
    let timeout = Duration::from_secs(5);
    let mut summary = RaceSummary {
        requests,
        ..Default::default()
    };
    for (n, correlation) in correlations.into_iter().enumerate() {
        match client.response(correlation, timeout).await {
            Ok(_) => summary.completed += 1,
            Err(e) if e.is_revoked() => summary.denied += 1,
            Err(e) => return Err(e.into()),
        }
        if n == 0 {
            let revoked = kernel.revoke(owner, cap.id)?;
            info!(capability = %cap.id, revoked = revoked.len(), "Revoked mid-stream");
        }
    }
    summary.audited_denials = kernel.audit().denials(&cap.id);

    kernel.shutdown()?;
    worker.await?;
    Ok(summary)
}

/// Boot from `config`, hand each boot-grant owner its initial set, and run
/// until interrupted (or immediately shut down with `once`).
pub async fn boot(config: WardenConfig, once: bool) -> Result<ShutdownReport, CliError> {
    let owners: BTreeSet<u32> = config.boot.grants.iter().map(|g| g.owner).collect();
    let kernel = Kernel::builder(config).build()?;

    for owner in owners {
        let set = kernel
            .dispatcher()
            .trap(ProcessId(owner), TRAP_ACQUIRE_INITIAL_CAPABILITIES)?;
        info!(owner, capabilities = set.len(), "Initial capabilities handed out");
        print_json(&set)?;
    }

    kernel.start()?;
    let worker = kernel.spawn_dispatcher();
    let sweeper = kernel.spawn_sweeper();

    if !once {
        info!("Kernel running; press Ctrl-C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C; shutting down");
        }
    }

    let report = kernel.shutdown()?;
    worker.await?;
    sweeper.await?;
    Ok(report)
}
