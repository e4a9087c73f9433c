//! Session Broker (C6): the core state machine tying a client channel to an
//! SSH transport and, optionally, a managed container.
//!
//! Each session's mutable state lives behind its own `tokio::sync::Mutex`.
//! Operations on a session are serialized by acquiring that lock for the
//! full duration of the operation, including any suspension while waiting
//! on the SSH connector or the container manager; this is deliberate. It
//! is what gives "at most one in-flight attempt per channel" and FIFO
//! ordering of connect/create-container/disconnect calls on the same
//! session, without a global lock that would serialize unrelated sessions
//! against each other. Mirrors the per-tunnel locking in `edge/src/tunnel.rs`,
//! scoped down from one `RwLock<HashMap<..>>` entry to one `Mutex` per
//! session.

use crate::channel::{ContainerRecordWire, ServerEvent};
use crate::containers::ContainerManager;
use crate::error::BrokerError;
use crate::ssh::{PtyProfile, SshAuth, SshCloseReason, SshConnectParams, SshConnector, SshTransport};
use crate::config::BrokerConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex as TokioMutex, MutexGuard};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    CreatingContainer,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

fn validate_credentials(c: &Credentials) -> Result<(), BrokerError> {
    if c.host.trim().is_empty() {
        return Err(BrokerError::Validation("host is required".into()));
    }
    if c.port == 0 {
        return Err(BrokerError::Validation("port must be between 1 and 65535".into()));
    }
    if c.username.trim().is_empty() {
        return Err(BrokerError::Validation("username is required".into()));
    }
    match &c.auth {
        SshAuth::Password(p) if p.is_empty() => {
            Err(BrokerError::Validation("password is required".into()))
        }
        SshAuth::PrivateKey { key_pem, .. } if key_pem.trim().is_empty() => {
            Err(BrokerError::Validation("private key is required".into()))
        }
        _ => Ok(()),
    }
}

/// Externally visible snapshot of a session, used by the HTTP admin surface
/// and the supervisor's sweeps.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub socket_id: String,
    pub status: SessionStatus,
    pub container_id: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

struct Session {
    socket_id: String,
    status: SessionStatus,
    credentials: Option<Credentials>,
    container_id: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    last_activity: Instant,
    last_connect_attempt: Option<Instant>,
    transport: Option<Arc<dyn SshTransport>>,
    /// Bumped every time the transport changes (connect or teardown); lets
    /// a stale background task detect that its work is no longer current.
    generation: u64,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    io_task: Option<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
}

pub struct SessionBroker {
    config: Arc<BrokerConfig>,
    containers: Arc<ContainerManager>,
    ssh: Arc<dyn SshConnector>,
    sessions: DashMap<String, Arc<TokioMutex<Session>>>,
}

impl SessionBroker {
    pub fn new(
        config: Arc<BrokerConfig>,
        containers: Arc<ContainerManager>,
        ssh: Arc<dyn SshConnector>,
    ) -> Self {
        Self {
            config,
            containers,
            ssh,
            sessions: DashMap::new(),
        }
    }

    /// Registers a freshly-upgraded WebSocket and returns its event stream.
    pub fn register(
        &self,
        socket_id: &str,
        alive: Arc<AtomicBool>,
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Session {
            socket_id: socket_id.to_string(),
            status: SessionStatus::Idle,
            credentials: None,
            container_id: None,
            connected_at: None,
            last_activity: Instant::now(),
            last_connect_attempt: None,
            transport: None,
            generation: 0,
            events_tx,
            io_task: None,
            alive,
        };
        self.sessions
            .insert(socket_id.to_string(), Arc::new(TokioMutex::new(session)));
        events_rx
    }

    fn get(&self, socket_id: &str) -> Option<Arc<TokioMutex<Session>>> {
        self.sessions.get(socket_id).map(|e| e.value().clone())
    }

    fn emit(guard: &Session, event: ServerEvent) {
        let _ = guard.events_tx.send(event);
    }

    fn emit_error(guard: &Session, err: BrokerError) {
        Self::emit(guard, ServerEvent::Error { message: err.client_message() });
    }

    fn busy_check(guard: &Session) -> Result<(), BrokerError> {
        match guard.status {
            SessionStatus::Connecting | SessionStatus::Connected | SessionStatus::CreatingContainer => {
                Err(BrokerError::Busy)
            }
            SessionStatus::Idle => Ok(()),
        }
    }

    /// Tears down any live transport/background task. Bumps `generation` so
    /// a forwarding task that is mid-flight on the old transport becomes a
    /// no-op when it eventually observes the closed channel.
    fn teardown_transport(guard: &mut Session) {
        guard.generation += 1;
        if let Some(t) = guard.transport.take() {
            t.close();
        }
        if let Some(task) = guard.io_task.take() {
            task.abort();
        }
    }

    pub async fn connect(&self, socket_id: &str, credentials: Credentials) -> Result<(), BrokerError> {
        validate_credentials(&credentials)?;
        let session_arc = self.get(socket_id).ok_or(BrokerError::Protocol)?;
        let mut guard = session_arc.lock().await;

        if let Some(last) = guard.last_connect_attempt {
            if last.elapsed() < self.config.min_connect_interval() {
                let err = BrokerError::RateLimited;
                Self::emit_error(&guard, err.clone());
                return Err(err);
            }
        }
        guard.last_connect_attempt = Some(Instant::now());

        if let Err(err) = Self::busy_check(&guard) {
            Self::emit_error(&guard, err.clone());
            return Err(err);
        }

        guard.status = SessionStatus::Connecting;
        self.do_connect(&session_arc, &mut guard, credentials).await
    }

    pub async fn create_container(&self, socket_id: &str) -> Result<(), BrokerError> {
        let session_arc = self.get(socket_id).ok_or(BrokerError::Protocol)?;
        let mut guard = session_arc.lock().await;

        if let Err(err) = Self::busy_check(&guard) {
            Self::emit_error(&guard, err.clone());
            return Err(err);
        }

        guard.status = SessionStatus::CreatingContainer;
        Self::emit(
            &guard,
            ServerEvent::ContainerCreating {
                message: "Creating container...".into(),
            },
        );

        let record = match self.containers.create().await {
            Ok(r) => r,
            Err(e) => {
                guard.status = SessionStatus::Idle;
                let err = BrokerError::from(e);
                Self::emit_error(&guard, err.clone());
                return Err(err);
            }
        };

        guard.container_id = Some(record.container_id.clone());
        Self::emit(
            &guard,
            ServerEvent::ContainerCreated(ContainerRecordWire::from(&record)),
        );

        tokio::time::sleep(self.config.container_ready_grace()).await;

        let credentials = Credentials {
            host: record.host,
            port: record.port,
            username: record.username,
            auth: SshAuth::Password(record.password),
        };

        guard.status = SessionStatus::Connecting;
        self.do_connect(&session_arc, &mut guard, credentials).await
    }

    async fn do_connect(
        &self,
        session_arc: &Arc<TokioMutex<Session>>,
        guard: &mut MutexGuard<'_, Session>,
        credentials: Credentials,
    ) -> Result<(), BrokerError> {
        let params = SshConnectParams {
            host: credentials.host.clone(),
            port: credentials.port,
            username: credentials.username.clone(),
            auth: credentials.auth.clone(),
            connect_timeout: self.config.connect_timeout(),
            keepalive: self.config.ssh_keepalive(),
            keepalive_max_miss: self.config.ssh_keepalive_max_miss,
            accept_any_host_key: self.config.accept_any_host_key,
            pty: PtyProfile::default(),
        };

        let outcome = tokio::time::timeout(self.config.connect_timeout(), self.ssh.connect(params)).await;

        match outcome {
            Err(_elapsed) => {
                guard.status = SessionStatus::Idle;
                Self::emit_error(guard, BrokerError::Timeout);
                Err(BrokerError::Timeout)
            }
            Ok(Err(e)) => {
                guard.status = SessionStatus::Idle;
                Self::emit_error(guard, e.clone());
                Err(e)
            }
            Ok(Ok(handle)) => {
                guard.status = SessionStatus::Connected;
                guard.connected_at = Some(Utc::now());
                guard.last_activity = Instant::now();
                guard.transport = Some(handle.transport);
                guard.credentials = Some(credentials.clone());
                guard.generation += 1;
                let gen = guard.generation;

                let task = tokio::spawn(forward_ssh_output(
                    handle.output_rx,
                    handle.closed_rx,
                    session_arc.clone(),
                    gen,
                ));
                guard.io_task = Some(task);

                Self::emit(
                    guard,
                    ServerEvent::Connected {
                        host: credentials.host,
                        port: credentials.port,
                        username: credentials.username,
                        container_id: guard.container_id.clone(),
                    },
                );
                Ok(())
            }
        }
    }

    pub async fn input(&self, socket_id: &str, bytes: &[u8]) {
        let Some(session_arc) = self.get(socket_id) else { return };
        let mut guard = session_arc.lock().await;
        if guard.status != SessionStatus::Connected {
            return;
        }
        if let Some(t) = &guard.transport {
            t.write(bytes);
        }
        guard.last_activity = Instant::now();
        let container_id = guard.container_id.clone();
        drop(guard);
        if let Some(cid) = container_id {
            self.containers.touch(&cid).await;
        }
    }

    pub async fn resize(
        &self,
        socket_id: &str,
        cols: u32,
        rows: u32,
        pixel_width: Option<u32>,
        pixel_height: Option<u32>,
    ) {
        if cols == 0 || rows == 0 {
            return;
        }
        let Some(session_arc) = self.get(socket_id) else { return };
        let guard = session_arc.lock().await;
        if guard.status == SessionStatus::Connected {
            if let Some(t) = &guard.transport {
                t.resize(cols, rows, pixel_width, pixel_height);
            }
        }
    }

    /// Explicit client disconnect: tears down the SSH transport but leaves
    /// any associated container running (spec §4.6: container outlives a
    /// plain disconnect; only `end_session` destroys it).
    pub async fn disconnect(&self, socket_id: &str, reason: &str) {
        let Some(session_arc) = self.get(socket_id) else { return };
        let mut guard = session_arc.lock().await;
        Self::teardown_transport(&mut guard);
        guard.status = SessionStatus::Idle;
        Self::emit(&guard, ServerEvent::Disconnected { reason: reason.into() });
    }

    /// Tears down the SSH transport and stops/destroys the associated
    /// container, then removes the session entirely.
    pub async fn end_session(&self, socket_id: &str) -> bool {
        let Some((_, session_arc)) = self.sessions.remove(socket_id) else {
            return false;
        };
        let mut guard = session_arc.lock().await;
        Self::teardown_transport(&mut guard);
        let container_id = guard.container_id.take();
        Self::emit(&guard, ServerEvent::Disconnected { reason: "end_session".into() });
        drop(guard);
        if let Some(cid) = container_id {
            let _ = self.containers.stop(&cid).await;
        }
        true
    }

    /// Removes a session from the table, tearing down its transport but
    /// preserving any container. Used when the channel itself goes away
    /// (client closed the socket, or a sweep judged it dead); the
    /// container is reclaimed later, if ever, by the idle-container sweep.
    pub async fn destroy_session(&self, socket_id: &str, reason: &str) {
        let Some((_, session_arc)) = self.sessions.remove(socket_id) else {
            return;
        };
        let mut guard = session_arc.lock().await;
        Self::teardown_transport(&mut guard);
        Self::emit(&guard, ServerEvent::Disconnected { reason: reason.into() });
    }

    /// Application-level heartbeat reply to a client `ping`.
    pub fn pong(&self, socket_id: &str) {
        if let Some(entry) = self.sessions.get(socket_id) {
            let _ = entry.value().try_lock().map(|g| Self::emit(&g, ServerEvent::Pong));
        }
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn snapshot(&self, socket_id: &str) -> Option<SessionRecord> {
        let session_arc = self.get(socket_id)?;
        let guard = session_arc.lock().await;
        Some(SessionRecord {
            socket_id: guard.socket_id.clone(),
            status: guard.status,
            container_id: guard.container_id.clone(),
            connected_at: guard.connected_at,
        })
    }

    pub async fn idle_for(&self, socket_id: &str) -> Option<std::time::Duration> {
        let session_arc = self.get(socket_id)?;
        let guard = session_arc.lock().await;
        Some(Instant::now().saturating_duration_since(guard.last_activity))
    }

    /// Health-sweep action for a session that has been `Connecting` (or
    /// `CreatingContainer`) past the stuck threshold: surface a timeout
    /// error to the client, then tear the session down.
    pub async fn fail_stuck_connecting(&self, socket_id: &str) {
        if let Some(session_arc) = self.get(socket_id) {
            let guard = session_arc.lock().await;
            Self::emit(&guard, ServerEvent::Error { message: "Connection timed out".into() });
        }
        self.destroy_session(socket_id, "connection_closed").await;
    }

    pub async fn is_stuck_connecting(&self, socket_id: &str, threshold: std::time::Duration) -> bool {
        let Some(session_arc) = self.get(socket_id) else { return false };
        let guard = session_arc.lock().await;
        matches!(guard.status, SessionStatus::Connecting | SessionStatus::CreatingContainer)
            && guard
                .last_connect_attempt
                .map(|t| t.elapsed() > threshold)
                .unwrap_or(false)
    }

    pub fn is_alive(&self, socket_id: &str) -> bool {
        self.sessions
            .get(socket_id)
            .map(|e| e.value().try_lock().map(|g| g.alive.load(Ordering::SeqCst)).unwrap_or(true))
            .unwrap_or(false)
    }
}

async fn forward_ssh_output(
    mut output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed_rx: tokio::sync::oneshot::Receiver<SshCloseReason>,
    session_arc: Arc<TokioMutex<Session>>,
    gen: u64,
) {
    let mut closed_rx = closed_rx;
    loop {
        tokio::select! {
            maybe_bytes = output_rx.recv() => {
                match maybe_bytes {
                    Some(bytes) => {
                        let guard = session_arc.lock().await;
                        if guard.generation != gen {
                            break;
                        }
                        SessionBroker::emit(
                            &guard,
                            ServerEvent::Output { bytes_b64: crate::channel::encode_bytes(&bytes) },
                        );
                    }
                    None => break,
                }
            }
            reason = &mut closed_rx => {
                let reason = reason.unwrap_or(SshCloseReason::Error);
                while let Ok(bytes) = output_rx.try_recv() {
                    let guard = session_arc.lock().await;
                    if guard.generation == gen {
                        SessionBroker::emit(
                            &guard,
                            ServerEvent::Output { bytes_b64: crate::channel::encode_bytes(&bytes) },
                        );
                    }
                }
                let mut guard = session_arc.lock().await;
                if guard.generation == gen && guard.status == SessionStatus::Connected {
                    guard.status = SessionStatus::Idle;
                    guard.transport = None;
                    let wire_reason = match reason {
                        SshCloseReason::Eof => "stream_closed",
                        SshCloseReason::Error => "connection_closed",
                        SshCloseReason::KeepaliveTimeout => "connection_closed",
                    };
                    SessionBroker::emit(&guard, ServerEvent::Disconnected { reason: wire_reason.into() });
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::fake::FakeRuntimeAdapter;
    use crate::ssh::fake::FakeSshConnector;

    fn broker(ssh: FakeSshConnector) -> SessionBroker {
        let mut cfg = BrokerConfig::default();
        cfg.start_port = 19_700;
        cfg.min_connect_interval_ms = 0;
        cfg.container_ready_grace_secs = 0;
        let cfg = Arc::new(cfg);
        let containers = Arc::new(ContainerManager::new(
            cfg.clone(),
            Arc::new(FakeRuntimeAdapter::default()),
        ));
        SessionBroker::new(cfg, containers, Arc::new(ssh))
    }

    fn creds() -> Credentials {
        Credentials {
            host: "127.0.0.1".into(),
            port: 2222,
            username: "root".into(),
            auth: SshAuth::Password("password123".into()),
        }
    }

    #[tokio::test]
    async fn connect_then_input_is_echoed_as_output() {
        let b = broker(FakeSshConnector::default());
        let mut rx = b.register("s1", Arc::new(AtomicBool::new(true)));
        b.connect("s1", creds()).await.unwrap();
        b.input("s1", b"pwd\n").await;

        // Connected event, then echoed output.
        assert!(matches!(rx.recv().await.unwrap(), ServerEvent::Connected { .. }));
        let ev = rx.recv().await.unwrap();
        match ev {
            ServerEvent::Output { bytes_b64 } => {
                assert_eq!(crate::channel::decode_bytes(&bytes_b64), b"pwd\n");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limited_second_attempt_is_rejected() {
        let mut cfg = BrokerConfig::default();
        cfg.start_port = 19_701;
        cfg.min_connect_interval_ms = 60_000;
        let cfg = Arc::new(cfg);
        let containers = Arc::new(ContainerManager::new(
            cfg.clone(),
            Arc::new(FakeRuntimeAdapter::default()),
        ));
        let b = SessionBroker::new(cfg, containers, Arc::new(FakeSshConnector::default()));
        let mut rx = b.register("s1", Arc::new(AtomicBool::new(true)));
        b.connect("s1", creds()).await.unwrap();
        let _ = rx.recv().await; // Connected
        let err = b.connect("s1", creds()).await.unwrap_err();
        assert!(matches!(err, BrokerError::RateLimited));
    }

    #[tokio::test]
    async fn auth_failure_returns_to_idle_and_allows_retry() {
        let b = broker(FakeSshConnector {
            fail_auth: true,
            ..Default::default()
        });
        let mut rx = b.register("s1", Arc::new(AtomicBool::new(true)));
        let err = b.connect("s1", creds()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Auth));
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, ServerEvent::Error { .. }));
        let snap = b.snapshot("s1").await.unwrap();
        assert!(matches!(snap.status, SessionStatus::Idle));
    }

    #[tokio::test]
    async fn disconnect_preserves_container_end_session_destroys_it() {
        let b = broker(FakeSshConnector::default());
        let mut rx = b.register("s1", Arc::new(AtomicBool::new(true)));
        b.create_container("s1").await.unwrap();
        let _ = rx.recv().await; // ContainerCreating
        let _ = rx.recv().await; // ContainerCreated
        let _ = rx.recv().await; // Connected
        let container_id = b.snapshot("s1").await.unwrap().container_id.unwrap();
        assert!(b.containers.list().await.iter().any(|r| r.container_id == container_id));

        b.disconnect("s1", "user_disconnect").await;
        assert!(b.containers.list().await.iter().any(|r| r.container_id == container_id));

        b.end_session("s1").await;
        assert!(b.containers.list().await.is_empty());
        assert!(b.snapshot("s1").await.is_none());
    }

    #[tokio::test]
    async fn busy_while_connecting_is_rejected() {
        let b = broker(FakeSshConnector {
            delay_before_ready: Some(std::time::Duration::from_millis(100)),
            ..Default::default()
        });
        let mut rx = b.register("s1", Arc::new(AtomicBool::new(true)));
        let b = Arc::new(b);
        let b2 = b.clone();
        let first = tokio::spawn(async move { b2.connect("s1", creds()).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let second = b.connect("s1", creds()).await;
        assert!(matches!(second.unwrap_err(), BrokerError::Busy));
        first.await.unwrap().unwrap();
        let _ = rx.recv().await;
    }
}
