//! Fault-path tests over the full remote stack: bounded retry, queue
//! draining on an unreachable device, and recovery once the link returns.

use labhost::client::RemoteClient;
use labhost::config::{InstrumentConfig, RetrySettings, Settings, TransportConfig};
use labhost::driver::ArgValue;
use labhost::error::LabError;
use labhost::proxy::ProxyServer;
use labhost::registry::Registry;
use labhost::session::SessionManager;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn spawn_host() -> SocketAddr {
    let mut settings = Settings::default();
    settings.retry = RetrySettings {
        max_attempts: 3,
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
    };
    settings.instruments.insert(
        "laser-1".to_string(),
        InstrumentConfig {
            driver: "mock".to_string(),
            transport: TransportConfig::Mock {
                replies: HashMap::new(),
            },
            commands: HashMap::new(),
        },
    );

    let registry = Arc::new(Registry::new(&settings.registry));
    let sessions = Arc::new(SessionManager::from_settings(&settings).expect("session manager"));
    let mut server_settings = settings.server.clone();
    server_settings.port = 0;
    let server = ProxyServer::bind(&server_settings, registry, sessions)
        .await
        .expect("bind proxy");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    addr
}

#[tokio::test]
async fn test_unreachable_device_fails_fast_then_recovers() {
    let addr = spawn_host().await;
    let mut alice = RemoteClient::connect(addr).await.expect("connect alice");
    let mut bob = RemoteClient::connect(addr).await.expect("connect bob");

    let token = alice
        .acquire("laser-1", "alice", None)
        .await
        .expect("alice acquires");

    // The link will stay down through the in-command retry budget (two
    // reconnects) and the first background probe.
    alice
        .execute("laser-1", token, "arm_reconnect_failures", vec![ArgValue::Int(3)])
        .await
        .expect("arm failures");

    let bob_task = tokio::spawn(async move {
        let result = bob
            .acquire("laser-1", "bob", Some(Duration::from_secs(5)))
            .await;
        (bob, result)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The failing command burns the whole retry budget, no more.
    let err = alice
        .execute("laser-1", token, "trip_link", vec![])
        .await
        .expect_err("command on a dead link");
    assert!(
        matches!(err, LabError::DeviceUnavailable { attempts: 3, .. }),
        "got {err:?}"
    );

    // Queued waiters are failed immediately instead of waiting forever.
    let (_bob, result) = bob_task.await.expect("bob task");
    assert!(
        matches!(result, Err(LabError::DeviceUnavailable { .. })),
        "got {result:?}"
    );

    // Alice's session is gone.
    let err = alice
        .execute("laser-1", token, "get_power", vec![])
        .await
        .expect_err("revoked token");
    assert!(matches!(err, LabError::SessionExpired), "got {err:?}");

    // The background probe reconnects within a few backoff periods, after
    // which service resumes.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let token = alice
        .acquire("laser-1", "carol", Some(Duration::from_secs(5)))
        .await
        .expect("acquire after recovery");
    alice
        .execute("laser-1", token, "get_power", vec![])
        .await
        .expect("command after recovery");
    alice.release("laser-1", token).await.expect("release");
}

#[tokio::test]
async fn test_device_rejection_keeps_the_session() {
    let addr = spawn_host().await;
    let mut client = RemoteClient::connect(addr).await.expect("connect");

    let token = client
        .acquire("laser-1", "alice", None)
        .await
        .expect("acquire");

    // An unknown operation is a rejection, not a link fault.
    let err = client
        .execute("laser-1", token, "warp_drive", vec![])
        .await
        .expect_err("unknown operation");
    assert!(matches!(err, LabError::Command(_)), "got {err:?}");

    // The session survives and the instrument still answers.
    client
        .execute("laser-1", token, "get_power", vec![])
        .await
        .expect("command after rejection");
    client.release("laser-1", token).await.expect("release");
}
