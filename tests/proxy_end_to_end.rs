//! End-to-end tests driving the full stack over localhost TCP: client,
//! wire protocol, proxy server, session manager and a mock instrument.

use labhost::config::{InstrumentConfig, RetrySettings, Settings, TransportConfig};
use labhost::driver::{ArgValue, CommandReply};
use labhost::error::LabError;
use labhost::client::RemoteClient;
use labhost::proxy::ProxyServer;
use labhost::registry::{InstrumentDescriptor, Registry};
use labhost::session::{SessionManager, SessionToken};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn test_settings() -> Settings {
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
    settings
}

/// Start a host on an ephemeral port and return its address.
async fn spawn_host() -> (SocketAddr, Arc<Registry>, Arc<SessionManager>) {
    let settings = test_settings();
    let registry = Arc::new(Registry::new(&settings.registry));
    let sessions = Arc::new(SessionManager::from_settings(&settings).expect("session manager"));

    let mut server_settings = settings.server.clone();
    server_settings.port = 0;
    let server = ProxyServer::bind(&server_settings, registry.clone(), sessions.clone())
        .await
        .expect("bind proxy");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    (addr, registry, sessions)
}

#[tokio::test]
async fn test_shared_laser_scenario() {
    let (addr, _registry, _sessions) = spawn_host().await;

    let mut alice = RemoteClient::connect(addr).await.expect("connect alice");
    let mut bob = RemoteClient::connect(addr).await.expect("connect bob");
    alice.ping().await.expect("ping");

    // Alice takes the laser; bob's acquire waits in the queue.
    let token_a = alice
        .acquire("laser-1", "alice", Some(Duration::from_secs(5)))
        .await
        .expect("alice acquires");

    let bob_task = tokio::spawn(async move {
        let token = bob
            .acquire("laser-1", "bob", Some(Duration::from_secs(5)))
            .await;
        (bob, token)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!bob_task.is_finished(), "bob acquired a held instrument");

    // Alice works the instrument while holding it.
    alice
        .execute("laser-1", token_a, "set_wavelength", vec![ArgValue::Float(1550.0)])
        .await
        .expect("set_wavelength");
    let reply = alice
        .execute("laser-1", token_a, "get_wavelength", vec![])
        .await
        .expect("get_wavelength");
    assert_eq!(reply, CommandReply::Float(1550.0));

    // Release passes the laser to bob, who sees alice's setting.
    alice.release("laser-1", token_a).await.expect("release");
    let (mut bob, token_b) = bob_task.await.expect("bob task");
    let token_b = token_b.expect("bob granted after release");

    let reply = bob
        .execute("laser-1", token_b, "get_wavelength", vec![])
        .await
        .expect("bob reads wavelength");
    assert_eq!(reply, CommandReply::Float(1550.0));
    bob.release("laser-1", token_b).await.expect("bob release");
}

#[tokio::test]
async fn test_commands_require_the_session_token() {
    let (addr, _registry, _sessions) = spawn_host().await;

    let mut alice = RemoteClient::connect(addr).await.expect("connect alice");
    let mut mallory = RemoteClient::connect(addr).await.expect("connect mallory");

    let token = alice
        .acquire("laser-1", "alice", None)
        .await
        .expect("alice acquires");

    // A guessed token is rejected without touching the instrument.
    let err = mallory
        .execute("laser-1", SessionToken::new(), "set_wavelength", vec![ArgValue::Float(1.0)])
        .await
        .expect_err("foreign token must be rejected");
    assert!(matches!(err, LabError::SessionExpired), "got {err:?}");

    let err = mallory
        .release("laser-1", SessionToken::new())
        .await
        .expect_err("foreign release must be rejected");
    assert!(matches!(err, LabError::SessionExpired), "got {err:?}");

    alice.release("laser-1", token).await.expect("release");
}

#[tokio::test]
async fn test_registry_over_the_wire() {
    let (addr, _registry, _sessions) = spawn_host().await;
    let mut client = RemoteClient::connect(addr).await.expect("connect");

    let descriptor = InstrumentDescriptor {
        name: "osa-2".to_string(),
        driver_type: "scpi".to_string(),
        host: "10.0.0.7".to_string(),
        port: 9090,
    };
    client.register(descriptor.clone()).await.expect("register");
    assert_eq!(client.lookup("osa-2").await.expect("lookup"), descriptor);
    assert!(client.list().await.expect("list").contains(&"osa-2".to_string()));

    // A different endpoint under the same live name is refused.
    let err = client
        .register(InstrumentDescriptor {
            port: 9999,
            ..descriptor.clone()
        })
        .await
        .expect_err("conflicting register");
    assert!(matches!(err, LabError::NameConflict(_)), "got {err:?}");

    client.deregister("osa-2").await.expect("deregister");
    let err = client.lookup("osa-2").await.expect_err("lookup after deregister");
    assert!(matches!(err, LabError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn test_disconnect_releases_held_session() {
    let (addr, _registry, _sessions) = spawn_host().await;

    let mut alice = RemoteClient::connect(addr).await.expect("connect alice");
    let _token = alice
        .acquire("laser-1", "alice", None)
        .await
        .expect("alice acquires");

    // Alice's process dies without releasing.
    drop(alice);

    // The server releases on her behalf; bob does not wait out the lease.
    let mut bob = RemoteClient::connect(addr).await.expect("connect bob");
    let token = bob
        .acquire("laser-1", "bob", Some(Duration::from_secs(5)))
        .await
        .expect("bob acquires after disconnect");
    bob.release("laser-1", token).await.expect("bob release");
}

#[tokio::test]
async fn test_instruments_and_unknown_names() {
    let (addr, _registry, _sessions) = spawn_host().await;
    let mut client = RemoteClient::connect(addr).await.expect("connect");

    assert_eq!(
        client.instruments().await.expect("instruments"),
        vec!["laser-1".to_string()]
    );

    let err = client
        .acquire("ghost-9", "alice", None)
        .await
        .expect_err("unknown instrument");
    assert!(matches!(err, LabError::NotFound(_)), "got {err:?}");

    let status = client.status("laser-1").await.expect("status");
    assert_eq!(status.name, "laser-1");
    assert_eq!(status.holder, None);
}
