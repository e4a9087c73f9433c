//! End-to-end scenario tests driving the session broker against the fake
//! container runtime and fake SSH connector, mirroring the six numbered
//! scenarios an operator would exercise over the WebSocket wire.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use termbroker::broker::{Credentials, SessionBroker, SessionStatus};
use termbroker::channel::{decode_bytes, ServerEvent};
use termbroker::config::BrokerConfig;
use termbroker::containers::fake::FakeRuntimeAdapter;
use termbroker::containers::ContainerManager;
use termbroker::ssh::fake::FakeSshConnector;
use termbroker::ssh::SshAuth;
use termbroker::supervisor::Supervisor;
use tokio::sync::mpsc::UnboundedReceiver;

fn test_config(start_port: u16) -> BrokerConfig {
    let mut cfg = BrokerConfig::default();
    cfg.start_port = start_port;
    cfg.container_ready_grace_secs = 0;
    cfg
}

fn setup(
    cfg: BrokerConfig,
    ssh: FakeSshConnector,
    socket_id: &str,
) -> (Arc<SessionBroker>, Arc<ContainerManager>, UnboundedReceiver<ServerEvent>) {
    let cfg = Arc::new(cfg);
    let containers = Arc::new(ContainerManager::new(cfg.clone(), Arc::new(FakeRuntimeAdapter::default())));
    let broker = Arc::new(SessionBroker::new(cfg, containers.clone(), Arc::new(ssh)));
    let rx = broker.register(socket_id, Arc::new(AtomicBool::new(true)));
    (broker, containers, rx)
}

fn password_creds(host: &str, port: u16) -> Credentials {
    Credentials {
        host: host.into(),
        port,
        username: "root".into(),
        auth: SshAuth::Password("password123".into()),
    }
}

#[tokio::test]
async fn scenario_1_happy_container_path() {
    let (broker, containers, mut rx) = setup(test_config(20_100), FakeSshConnector::default(), "s1");

    broker.create_container("s1").await.unwrap();

    assert!(matches!(rx.recv().await.unwrap(), ServerEvent::ContainerCreating { .. }));

    let container_id = match rx.recv().await.unwrap() {
        ServerEvent::ContainerCreated(rec) => {
            assert!(rec.port >= 2222);
            assert_eq!(rec.username, "root");
            rec.container_id
        }
        other => panic!("expected container-created, got {other:?}"),
    };

    match rx.recv().await.unwrap() {
        ServerEvent::Connected { container_id: cid, .. } => {
            assert_eq!(cid.as_deref(), Some(container_id.as_str()));
        }
        other => panic!("expected connected, got {other:?}"),
    }

    broker.input("s1", b"pwd\n").await;
    match rx.recv().await.unwrap() {
        ServerEvent::Output { bytes_b64 } => {
            assert_eq!(decode_bytes(&bytes_b64), b"pwd\n");
        }
        other => panic!("expected output, got {other:?}"),
    }

    assert_eq!(containers.list().await.len(), 1);
    let snapshot = broker.snapshot("s1").await.unwrap();
    assert!(matches!(snapshot.status, SessionStatus::Connected));
}

#[tokio::test]
async fn scenario_2_auth_failure_returns_to_idle() {
    let ssh = FakeSshConnector {
        fail_auth: true,
        ..Default::default()
    };
    let (broker, _containers, mut rx) = setup(test_config(20_110), ssh, "s1");

    let err = broker
        .connect("s1", password_creds("127.0.0.1", 2222))
        .await
        .unwrap_err();
    assert_eq!(err.client_message(), "Authentication failed - check username and password");

    match rx.recv().await.unwrap() {
        ServerEvent::Error { message } => {
            assert_eq!(message, "Authentication failed - check username and password");
        }
        other => panic!("expected error, got {other:?}"),
    }

    let snapshot = broker.snapshot("s1").await.unwrap();
    assert!(matches!(snapshot.status, SessionStatus::Idle));
}

#[tokio::test]
async fn scenario_3_rate_limit_on_rapid_retry() {
    let (broker, _containers, mut rx) = setup(test_config(20_120), FakeSshConnector::default(), "s1");

    broker.connect("s1", password_creds("127.0.0.1", 2222)).await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), ServerEvent::Connected { .. }));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let err = broker
        .connect("s1", password_creds("127.0.0.1", 2222))
        .await
        .unwrap_err();
    assert_eq!(
        err.client_message(),
        "Too many connection attempts. Please wait before trying again."
    );
}

#[tokio::test]
async fn scenario_4_explicit_disconnect_preserves_container() {
    let (broker, containers, mut rx) = setup(test_config(20_130), FakeSshConnector::default(), "s1");

    broker.create_container("s1").await.unwrap();
    let _ = rx.recv().await; // creating
    let _ = rx.recv().await; // created
    let _ = rx.recv().await; // connected
    let container_id = broker.snapshot("s1").await.unwrap().container_id.unwrap();

    broker.disconnect("s1", "user_disconnect").await;
    match rx.recv().await.unwrap() {
        ServerEvent::Disconnected { reason } => assert_eq!(reason, "user_disconnect"),
        other => panic!("expected disconnected, got {other:?}"),
    }
    assert!(containers.list().await.iter().any(|r| r.container_id == container_id));
    let snapshot = broker.snapshot("s1").await.unwrap();
    assert_eq!(snapshot.container_id.as_deref(), Some(container_id.as_str()));

    // Reconnect using the cached container's coordinates.
    let record = containers
        .list()
        .await
        .into_iter()
        .find(|r| r.container_id == container_id)
        .unwrap();
    broker
        .connect("s1", password_creds(&record.host, record.port))
        .await
        .unwrap();
    assert!(matches!(rx.recv().await.unwrap(), ServerEvent::Connected { .. }));
}

#[tokio::test]
async fn scenario_5_end_session_destroys_container() {
    let (broker, containers, mut rx) = setup(test_config(20_140), FakeSshConnector::default(), "s1");

    broker.create_container("s1").await.unwrap();
    let _ = rx.recv().await;
    let _ = rx.recv().await;
    let _ = rx.recv().await;

    let cleaned = broker.end_session("s1").await;
    assert!(cleaned);
    assert!(containers.list().await.is_empty());
    assert!(broker.snapshot("s1").await.is_none());

    // Input on a destroyed session is a no-op, not a panic.
    broker.input("s1", b"ignored\n").await;
}

#[tokio::test]
async fn scenario_6_idle_session_and_container_reap() {
    let mut cfg = test_config(20_150);
    cfg.idle_timeout_secs = 0;
    cfg.session_sweep_interval_secs = 1;
    cfg.container_sweep_interval_secs = 1;
    let cfg = Arc::new(cfg);

    let containers = Arc::new(ContainerManager::new(cfg.clone(), Arc::new(FakeRuntimeAdapter::default())));
    let broker = Arc::new(SessionBroker::new(
        cfg.clone(),
        containers.clone(),
        Arc::new(FakeSshConnector::default()),
    ));
    let mut rx = broker.register("s1", Arc::new(AtomicBool::new(true)));

    broker.create_container("s1").await.unwrap();
    let _ = rx.recv().await;
    let _ = rx.recv().await;
    let _ = rx.recv().await;
    assert_eq!(containers.list().await.len(), 1);

    let supervisor = Arc::new(Supervisor::new(cfg, broker.clone(), containers.clone()));
    let handles = supervisor.spawn();

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    match rx.recv().await.unwrap() {
        ServerEvent::Disconnected { reason } => assert_eq!(reason, "idle_timeout"),
        other => panic!("expected idle_timeout disconnect, got {other:?}"),
    }
    assert!(broker.snapshot("s1").await.is_none());

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(containers.list().await.is_empty());

    for handle in handles {
        handle.abort();
    }
}
