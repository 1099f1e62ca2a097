//! End-to-end Tier 2 behavior on the tokio scheduler.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use warden_core::channel::CancelOutcome;
use warden_core::error::{ChannelError, DispatchError};
use warden_core::registry::RevocationCause;
use warden_core::{
    AsyncClient, CapabilityRequest, CorrelationId, Error, Kernel, OperationKind, Permissions, ProcessId,
    ResourceKind, WardenConfig,
};

const USER: ProcessId = ProcessId(21);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn running_kernel(config: WardenConfig) -> Arc<Kernel> {
    init_tracing();
    let kernel = Kernel::builder(config).build().unwrap();
    kernel.start().unwrap();
    kernel
}

fn client(kernel: &Kernel, descriptor: &str, capacity: Option<usize>) -> AsyncClient {
    let cap = kernel
        .request(
            USER,
            CapabilityRequest::new(ResourceKind::Memory, descriptor, Permissions::READ | Permissions::WRITE),
        )
        .unwrap();
    let ch = kernel.open_channel(USER, cap.id, capacity).unwrap();
    kernel.async_client(USER, ch.id).unwrap()
}

#[tokio::test]
async fn test_calls_complete_through_dispatcher_loop() {
    let kernel = running_kernel(WardenConfig::default());
    let worker = kernel.spawn_dispatcher();
    let client = client(&kernel, "e2e:8", None);

    let writes = (0..8u8).map(|i| {
        client.call(OperationKind::Write, json!({ "offset": i, "data": [i * 2] }))
    });
    for result in join_all(writes).await {
        assert_eq!(result.unwrap(), json!({ "written": 1 }));
    }

    let read = client
        .call(OperationKind::Read, json!({ "len": 8 }))
        .await
        .unwrap();
    assert_eq!(read, json!({ "data": [0, 2, 4, 6, 8, 10, 12, 14] }));

    kernel.shutdown().unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_timeout_cancels_the_request() {
    let mut config = WardenConfig::default();
    config.dispatch.response_timeout_ms = 50;
    let kernel = running_kernel(config);
    let client = client(&kernel, "slow", None);

    // No dispatcher is running, so the request never completes.
    let err = client
        .call(OperationKind::Read, json!({ "len": 1 }))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Dispatch(DispatchError::Timeout(50)));
    assert!(err.is_retryable());
    assert_eq!(kernel.channels().queued_len(client.channel()).unwrap(), 0);

    let err = client.cancel(CorrelationId(1)).unwrap_err();
    assert_eq!(err, Error::Channel(ChannelError::UnknownCorrelation(CorrelationId(1))));
}

#[tokio::test]
async fn test_revocation_wakes_pending_receiver() {
    let kernel = running_kernel(WardenConfig::default());
    let client = Arc::new(client(&kernel, "doomed", None));
    let cap = kernel.channels().snapshot(client.channel()).unwrap().capability;

    let correlation = client
        .send(OperationKind::Write, json!({ "data": [1] }))
        .await
        .unwrap();
    let waiter = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.response(correlation, Duration::from_secs(30)).await })
    };
    tokio::task::yield_now().await;

    kernel.revoke(USER, cap).unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(err.is_revoked());

    let err = client
        .send(OperationKind::Read, json!({ "len": 1 }))
        .await
        .unwrap_err();
    assert!(err.is_revoked());
}

#[tokio::test]
async fn test_full_channel_parks_sender_until_response_is_read() {
    let kernel = running_kernel(WardenConfig::default());
    let client = Arc::new(client(&kernel, "narrow", Some(1)));
    let ch = client.channel();

    let first = client
        .send(OperationKind::Write, json!({ "data": [1] }))
        .await
        .unwrap();
    let sender = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send(OperationKind::Write, json!({ "offset": 1, "data": [2] })).await })
    };
    while kernel.channels().snapshot(ch).unwrap().parked == 0 {
        tokio::task::yield_now().await;
    }

    // The unread response still holds the only slot.
    assert_eq!(kernel.dispatcher().run_until_idle(), 1);
    tokio::task::yield_now().await;
    assert!(!sender.is_finished());
    assert_eq!(kernel.channels().snapshot(ch).unwrap().parked, 1);

    let timeout = Duration::from_secs(1);
    assert_eq!(client.response(first, timeout).await.unwrap(), json!({ "written": 1 }));
    let second = sender.await.unwrap().unwrap();
    assert_eq!(second, CorrelationId(2));

    assert_eq!(kernel.dispatcher().run_until_idle(), 1);
    assert_eq!(client.response(second, timeout).await.unwrap(), json!({ "written": 1 }));
}

#[tokio::test]
async fn test_cancel_parked_sender() {
    let kernel = running_kernel(WardenConfig::default());
    let client = Arc::new(client(&kernel, "cancel-parked", Some(1)));
    let ch = client.channel();

    client
        .send(OperationKind::Write, json!({ "data": [1] }))
        .await
        .unwrap();
    let sender = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send(OperationKind::Write, json!({ "data": [2] })).await })
    };
    while kernel.channels().snapshot(ch).unwrap().parked == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(client.cancel(CorrelationId(2)).unwrap(), CancelOutcome::Removed);
    let err = sender.await.unwrap().unwrap_err();
    assert_eq!(err, Error::Dispatch(DispatchError::Cancelled(CorrelationId(2))));
    assert_eq!(kernel.dispatcher().run_until_idle(), 1);
}

#[tokio::test]
async fn test_sweeper_revokes_expired_capabilities() {
    let mut config = WardenConfig::default();
    config.registry.sweep_interval_ms = 10;
    let kernel = running_kernel(config);
    let sweeper = kernel.spawn_sweeper();

    let cap = kernel
        .request(
            USER,
            CapabilityRequest::new(ResourceKind::Storage, "/tmp/lease", Permissions::READ)
                .with_ttl(chrono::Duration::milliseconds(20)),
        )
        .unwrap();
    let ch = kernel.open_channel(USER, cap.id, None).unwrap().id;

    let swept = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(revocation) = kernel.registry().get(&cap.id).and_then(|c| c.revocation) {
                return revocation;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(swept.cause, RevocationCause::Expired);
    assert!(kernel.channels().state(ch).unwrap().is_closed());

    kernel.shutdown().unwrap();
    tokio::time::timeout(Duration::from_secs(5), sweeper)
        .await
        .unwrap()
        .unwrap();
}
