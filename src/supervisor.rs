//! Supervisor (C7): background sweeps that keep the session table and
//! container fleet bounded even when a client disappears uncleanly, plus
//! graceful shutdown wiring. Grounded in the periodic-task shape used by
//! the teacher's edge appliance health checks, restructured here as three
//! independently-scheduled `tokio::time::interval` loops rather than one.

use crate::broker::SessionBroker;
use crate::config::BrokerConfig;
use crate::containers::ContainerManager;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct Supervisor {
    config: Arc<BrokerConfig>,
    broker: Arc<SessionBroker>,
    containers: Arc<ContainerManager>,
}

impl Supervisor {
    pub fn new(
        config: Arc<BrokerConfig>,
        broker: Arc<SessionBroker>,
        containers: Arc<ContainerManager>,
    ) -> Self {
        Self {
            config,
            broker,
            containers,
        }
    }

    /// Spawns the three sweeps as independent background tasks.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().idle_session_sweep()),
            tokio::spawn(self.clone().health_sweep()),
            tokio::spawn(self.clone().container_sweep()),
        ]
    }

    /// Every `session_sweep_interval` (default 5m): destroy sessions whose
    /// channel has been idle past `idle_timeout` (default 30m).
    async fn idle_session_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.session_sweep_interval());
        loop {
            ticker.tick().await;
            for id in self.broker.list_ids() {
                let Some(idle) = self.broker.idle_for(&id).await else { continue };
                if idle > self.config.idle_timeout() {
                    tracing::info!(socket_id = %id, idle_secs = idle.as_secs(), "reaping idle session");
                    self.broker.destroy_session(&id, "idle_timeout").await;
                }
            }
        }
    }

    /// Every `health_sweep_interval` (default 1m): fail sessions stuck in
    /// `Connecting`/`CreatingContainer` past `stuck_connecting_timeout`
    /// (default 60s); destroy sessions whose channel is no longer live (a
    /// backstop for the case where the WebSocket task's own cleanup on
    /// disconnect did not run, e.g. a panic); destroy sessions idle past
    /// `idle_timeout` (default 30m) with reason `inactive`.
    async fn health_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.health_sweep_interval());
        loop {
            ticker.tick().await;
            for id in self.broker.list_ids() {
                if self
                    .broker
                    .is_stuck_connecting(&id, self.config.stuck_connecting_timeout())
                    .await
                {
                    tracing::warn!(socket_id = %id, "connection attempt stuck, failing session");
                    self.broker.fail_stuck_connecting(&id).await;
                    continue;
                }
                if !self.broker.is_alive(&id) {
                    tracing::info!(socket_id = %id, "channel no longer live, destroying session");
                    self.broker.destroy_session(&id, "connection_closed").await;
                    continue;
                }
                let Some(idle) = self.broker.idle_for(&id).await else { continue };
                if idle > self.config.idle_timeout() {
                    tracing::info!(socket_id = %id, idle_secs = idle.as_secs(), "session inactive, destroying");
                    self.broker.destroy_session(&id, "inactive").await;
                }
            }
        }
    }

    /// Every `container_sweep_interval` (default 10m): stop containers
    /// whose last touch predates `idle_timeout`.
    async fn container_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.container_sweep_interval());
        loop {
            ticker.tick().await;
            let reaped = self.containers.reap_idle(self.config.idle_timeout()).await;
            if reaped > 0 {
                tracing::info!(count = reaped, "reaped idle containers");
            }
        }
    }

    /// Orderly shutdown (spec §4.7): notify every live channel with
    /// `server_shutdown`, tear down every SSH transport, then stop every
    /// container. Called from `main`'s signal-handling path once the
    /// channel server has stopped accepting new connections.
    pub async fn shutdown(&self) {
        for id in self.broker.list_ids() {
            tracing::info!(socket_id = %id, "notifying session of shutdown");
            self.broker.destroy_session(&id, "server_shutdown").await;
        }

        for record in self.containers.list().await {
            tracing::info!(container_id = %record.container_id, "stopping container for shutdown");
            if let Err(e) = self.containers.stop(&record.container_id).await {
                tracing::warn!(container_id = %record.container_id, error = %e, "failed to stop container during shutdown");
            }
        }
    }
}

/// Resolves once SIGINT or (on unix) SIGTERM is observed.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Credentials;
    use crate::channel::ServerEvent;
    use crate::containers::fake::FakeRuntimeAdapter;
    use crate::ssh::fake::FakeSshConnector;
    use crate::ssh::SshAuth;
    use std::sync::atomic::AtomicBool;

    fn setup(cfg: BrokerConfig) -> (Arc<Supervisor>, Arc<SessionBroker>, Arc<ContainerManager>) {
        let cfg = Arc::new(cfg);
        let containers = Arc::new(ContainerManager::new(
            cfg.clone(),
            Arc::new(FakeRuntimeAdapter::default()),
        ));
        let broker = Arc::new(SessionBroker::new(
            cfg.clone(),
            containers.clone(),
            Arc::new(FakeSshConnector::default()),
        ));
        let supervisor = Arc::new(Supervisor::new(cfg, broker.clone(), containers.clone()));
        (supervisor, broker, containers)
    }

    fn test_config(start_port: u16) -> BrokerConfig {
        let mut cfg = BrokerConfig::default();
        cfg.start_port = start_port;
        cfg.container_ready_grace_secs = 0;
        cfg
    }

    #[tokio::test]
    async fn shutdown_notifies_sessions_and_stops_containers() {
        let (supervisor, broker, containers) = setup(test_config(20_200));
        let mut rx = broker.register("s1", Arc::new(AtomicBool::new(true)));
        broker.create_container("s1").await.unwrap();
        let _ = rx.recv().await; // creating
        let _ = rx.recv().await; // created
        let _ = rx.recv().await; // connected
        assert_eq!(containers.list().await.len(), 1);

        supervisor.shutdown().await;

        match rx.recv().await.unwrap() {
            ServerEvent::Disconnected { reason } => assert_eq!(reason, "server_shutdown"),
            other => panic!("expected server_shutdown disconnect, got {other:?}"),
        }
        assert!(broker.snapshot("s1").await.is_none());
        assert!(containers.list().await.is_empty());
    }

    #[tokio::test]
    async fn health_sweep_destroys_inactive_sessions_with_reason() {
        // A zero idle_timeout makes a freshly-connected session immediately
        // eligible, so the sweep doesn't need a fast-forwarded clock; a 50ms
        // sweep interval keeps the test itself fast.
        let mut cfg = test_config(20_210);
        cfg.idle_timeout_secs = 0;
        cfg.health_sweep_interval_secs = 0; // tokio::time::interval floors to 1 tick
        let (supervisor, broker, _containers) = setup(cfg);

        let mut rx = broker.register("s1", Arc::new(AtomicBool::new(true)));
        broker
            .connect(
                "s1",
                Credentials {
                    host: "127.0.0.1".into(),
                    port: 2222,
                    username: "root".into(),
                    auth: SshAuth::Password("password123".into()),
                },
            )
            .await
            .unwrap();
        assert!(matches!(rx.recv().await.unwrap(), ServerEvent::Connected { .. }));

        let handle = tokio::spawn(supervisor.clone().health_sweep());
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        match rx.recv().await.unwrap() {
            ServerEvent::Disconnected { reason } => assert_eq!(reason, "inactive"),
            other => panic!("expected inactive disconnect, got {other:?}"),
        }
        assert!(broker.snapshot("s1").await.is_none());

        handle.abort();
    }
}
