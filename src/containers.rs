//! Container Manager (C3): builds the SSH image once, creates/tracks/destroys
//! containers, and tracks per-container last-activity.
//!
//! Locking discipline (spec §4.3/§5): the manager's mutex is never held
//! across a subprocess call. Each operation copies what it needs, drops the
//! guard, awaits the runtime, then re-locks to commit the outcome.

use crate::config::BrokerConfig;
use crate::error::{ContainerError, PortError, ProcessError};
use crate::ports;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

/// A Debian-based SSH image: root login with a password, PAM disabled,
/// daemon in the foreground. Any runtime-adapter implementation that
/// produces this externally observable behavior is conformant (spec §6).
pub fn image_recipe(root_password: &str) -> String {
    format!(
        r#"FROM debian:bookworm-slim
RUN apt-get update && apt-get install -y --no-install-recommends openssh-server \
    && mkdir -p /var/run/sshd \
    && echo 'root:{password}' | chpasswd \
    && sed -i 's/^#\?PermitRootLogin.*/PermitRootLogin yes/' /etc/ssh/sshd_config \
    && sed -i 's/^#\?PasswordAuthentication.*/PasswordAuthentication yes/' /etc/ssh/sshd_config \
    && sed -i 's/^UsePAM yes/UsePAM no/' /etc/ssh/sshd_config \
    && rm -rf /var/lib/apt/lists/*
EXPOSE 22
CMD ["/usr/sbin/sshd", "-D"]
"#,
        password = root_password
    )
}

#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub container_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
}

#[derive(Debug, Clone)]
pub struct ContainerStats {
    pub container_id: String,
    pub port: u16,
    pub host: String,
    pub created_at: DateTime<Utc>,
    pub duration: Duration,
    pub idle_time: Duration,
    pub is_active: bool,
}

/// Abstraction over the container runtime CLI so the manager can be tested
/// without a real Docker daemon. The real implementation shells out via C1
/// (`process::run`); the fake implementation used in tests simulates the
/// externally observable behavior in-memory.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn image_exists(&self, tag: &str) -> Result<bool, ContainerError>;
    async fn build_image(&self, tag: &str, recipe: &str) -> Result<(), ContainerError>;
    /// Starts a container publishing container-port 22 to `host_port`.
    /// Returns the (possibly truncated) container id.
    async fn start(&self, tag: &str, host_port: u16) -> Result<String, ContainerError>;
    async fn stop(&self, container_id: &str) -> Result<(), ContainerError>;
}

/// Shells out to the configured runtime binary (default `docker`).
pub struct DockerRuntimeAdapter {
    binary: String,
}

impl DockerRuntimeAdapter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for DockerRuntimeAdapter {
    async fn image_exists(&self, tag: &str) -> Result<bool, ContainerError> {
        match crate::process::run(&self.binary, &["image", "inspect", tag]).await {
            Ok(_) => Ok(true),
            Err(ProcessError::NonZeroExit { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, tag: &str, recipe: &str) -> Result<(), ContainerError> {
        let dir = std::env::temp_dir().join(format!("termbroker-image-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)
            .map_err(|e| ContainerError::ImageBuild(e.to_string()))?;
        let dockerfile = dir.join("Dockerfile");
        std::fs::write(&dockerfile, recipe)
            .map_err(|e| ContainerError::ImageBuild(e.to_string()))?;

        let dir_str = dir.to_string_lossy().into_owned();
        let result = crate::process::run(
            &self.binary,
            &["build", "-t", tag, &dir_str],
        )
        .await;

        let _ = std::fs::remove_dir_all(&dir);

        result
            .map(|_| ())
            .map_err(|e| ContainerError::ImageBuild(e.to_string()))
    }

    async fn start(&self, tag: &str, host_port: u16) -> Result<String, ContainerError> {
        let port_map = format!("{}:22", host_port);
        let output = crate::process::run(
            &self.binary,
            &["run", "-d", "-p", &port_map, tag],
        )
        .await?;
        let id = output.stdout.trim();
        if id.is_empty() {
            return Err(ContainerError::NoContainerId);
        }
        Ok(id.chars().take(12).collect())
    }

    async fn stop(&self, container_id: &str) -> Result<(), ContainerError> {
        match crate::process::run(&self.binary, &["stop", container_id]).await {
            Ok(_) => {}
            Err(ProcessError::NonZeroExit { stderr_tail, .. })
                if stderr_tail.contains("No such container") => {}
            Err(e) => return Err(e.into()),
        }
        match crate::process::run(&self.binary, &["rm", "-f", container_id]).await {
            Ok(_) => Ok(()),
            Err(ProcessError::NonZeroExit { stderr_tail, .. })
                if stderr_tail.contains("No such container") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct ManagerState {
    image_built: bool,
    containers: HashMap<String, ContainerRecord>,
}

pub struct ContainerManager {
    config: Arc<BrokerConfig>,
    runtime: Arc<dyn RuntimeAdapter>,
    /// CPU-only critical section (map reads/writes), never held across an
    /// `.await`; a plain sync mutex, not `tokio::sync::Mutex`.
    state: SyncMutex<ManagerState>,
    /// Serializes concurrent `ensure_image` callers so the build runs at
    /// most once; all callers succeed or fail together. This one spans the
    /// runtime build `.await`, so it must be the async-aware mutex.
    build_lock: AsyncMutex<()>,
}

impl ContainerManager {
    pub fn new(config: Arc<BrokerConfig>, runtime: Arc<dyn RuntimeAdapter>) -> Self {
        Self {
            config,
            runtime,
            state: SyncMutex::new(ManagerState {
                image_built: false,
                containers: HashMap::new(),
            }),
            build_lock: AsyncMutex::new(()),
        }
    }

    pub async fn ensure_image(&self) -> Result<(), ContainerError> {
        let _build_guard = self.build_lock.lock().await;
        if self.state.lock().image_built {
            return Ok(());
        }

        // The in-memory flag only tracks builds done by this process; a
        // prior process may already have built the image into the runtime's
        // own store, so check there before paying for another build.
        if self.runtime.image_exists(&self.config.image_tag).await? {
            self.state.lock().image_built = true;
            return Ok(());
        }

        let recipe = image_recipe(&self.config.container_root_password);
        let result = self
            .runtime
            .build_image(&self.config.image_tag, &recipe)
            .await;

        match result {
            Ok(()) => {
                self.state.lock().image_built = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn create(&self) -> Result<ContainerRecord, ContainerError> {
        self.ensure_image().await?;

        let port = ports::allocate(self.config.start_port)
            .await
            .map_err(ContainerError::Port)?;

        let container_id = match self.runtime.start(&self.config.image_tag, port).await {
            Ok(id) => id,
            Err(e) => return Err(e),
        };

        let host = "127.0.0.1".to_string();
        if let Err(e) = ports::await_listener(
            &host,
            port,
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
        .await
        {
            // Roll back: best-effort stop of the orphaned container.
            let _ = self.runtime.stop(&container_id).await;
            return Err(ContainerError::Port(e));
        }

        let record = ContainerRecord {
            container_id: container_id.clone(),
            host,
            port,
            username: "root".to_string(),
            password: self.config.container_root_password.clone(),
            created_at: Utc::now(),
            last_activity: Instant::now(),
        };

        self.state
            .lock()
            .containers
            .insert(container_id, record.clone());

        Ok(record)
    }

    pub async fn stop(&self, container_id: &str) -> Result<(), ContainerError> {
        // Runtime call happens without holding the state lock.
        self.runtime.stop(container_id).await?;
        self.state.lock().containers.remove(container_id);
        Ok(())
    }

    pub async fn touch(&self, container_id: &str) {
        if let Some(record) = self.state.lock().containers.get_mut(container_id) {
            record.last_activity = Instant::now();
        }
    }

    pub async fn list(&self) -> Vec<ContainerRecord> {
        self.state.lock().containers.values().cloned().collect()
    }

    pub async fn stats(&self) -> Vec<ContainerStats> {
        let now = Instant::now();
        let wall_now = Utc::now();
        self.state
            .lock()
            .containers
            .values()
            .map(|r| {
                let idle_time = now.saturating_duration_since(r.last_activity);
                let duration = (wall_now - r.created_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                ContainerStats {
                    container_id: r.container_id.clone(),
                    port: r.port,
                    host: r.host.clone(),
                    created_at: r.created_at,
                    duration,
                    idle_time,
                    is_active: idle_time < Duration::from_secs(30),
                }
            })
            .collect()
    }

    /// Stops every container whose `last_activity` is older than `max_idle`.
    /// Returns the count reaped.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = {
            let state = self.state.lock();
            state
                .containers
                .values()
                .filter(|r| now.saturating_duration_since(r.last_activity) > max_idle)
                .map(|r| r.container_id.clone())
                .collect()
        };

        let mut reaped = 0;
        for id in stale {
            if self.stop(&id).await.is_ok() {
                reaped += 1;
            }
        }
        reaped
    }
}

/// In-memory runtime used by tests: no real Docker daemon required.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as TMutex;

    pub struct FakeRuntimeAdapter {
        next_id: AtomicU64,
        images: TMutex<std::collections::HashSet<String>>,
        listeners: TMutex<HashMap<String, tokio::task::JoinHandle<()>>>,
        pub fail_build: std::sync::atomic::AtomicBool,
        pub fail_start: std::sync::atomic::AtomicBool,
    }

    impl Default for FakeRuntimeAdapter {
        fn default() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                images: TMutex::new(std::collections::HashSet::new()),
                listeners: TMutex::new(HashMap::new()),
                fail_build: std::sync::atomic::AtomicBool::new(false),
                fail_start: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl RuntimeAdapter for FakeRuntimeAdapter {
        async fn image_exists(&self, tag: &str) -> Result<bool, ContainerError> {
            Ok(self.images.lock().await.contains(tag))
        }

        async fn build_image(&self, tag: &str, _recipe: &str) -> Result<(), ContainerError> {
            if self.fail_build.load(Ordering::SeqCst) {
                return Err(ContainerError::ImageBuild("simulated failure".into()));
            }
            self.images.lock().await.insert(tag.to_string());
            Ok(())
        }

        async fn start(&self, _tag: &str, host_port: u16) -> Result<String, ContainerError> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ContainerError::NoContainerId);
            }
            let id = format!("{:012x}", self.next_id.fetch_add(1, Ordering::SeqCst));
            // Simulate "sshd becoming ready" by actually binding the port.
            let listener = TcpListener::bind(("127.0.0.1", host_port))
                .await
                .map_err(|e| ContainerError::ImageBuild(e.to_string()))?;
            let handle = tokio::spawn(async move {
                loop {
                    if listener.accept().await.is_err() {
                        break;
                    }
                }
            });
            self.listeners.lock().await.insert(id.clone(), handle);
            Ok(id)
        }

        async fn stop(&self, container_id: &str) -> Result<(), ContainerError> {
            if let Some(handle) = self.listeners.lock().await.remove(container_id) {
                handle.abort();
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeRuntimeAdapter;
    use super::*;

    fn manager() -> ContainerManager {
        let mut cfg = BrokerConfig::default();
        cfg.start_port = 19_500;
        ContainerManager::new(Arc::new(cfg), Arc::new(FakeRuntimeAdapter::default()))
    }

    #[tokio::test]
    async fn create_then_stop_returns_to_empty_state() {
        let mgr = manager();
        let record = mgr.create().await.unwrap();
        assert!(mgr.list().await.iter().any(|r| r.container_id == record.container_id));

        mgr.stop(&record.container_id).await.unwrap();
        assert!(mgr.list().await.is_empty());
    }

    #[tokio::test]
    async fn stop_unknown_is_a_noop() {
        let mgr = manager();
        mgr.stop("does-not-exist").await.unwrap();
    }

    #[tokio::test]
    async fn touch_unknown_is_a_noop() {
        let mgr = manager();
        mgr.touch("does-not-exist").await; // must not panic
    }

    #[tokio::test]
    async fn ensure_image_builds_exactly_once() {
        let mgr = manager();
        mgr.ensure_image().await.unwrap();
        mgr.ensure_image().await.unwrap();
        mgr.ensure_image().await.unwrap();
        // Second+ calls are no-ops because image_built flips to true.
    }

    #[tokio::test]
    async fn reap_idle_stops_stale_containers() {
        let mgr = manager();
        let record = mgr.create().await.unwrap();
        {
            let mut state = mgr.state.lock();
            let r = state.containers.get_mut(&record.container_id).unwrap();
            r.last_activity = Instant::now() - Duration::from_secs(3600);
        }
        let reaped = mgr.reap_idle(Duration::from_secs(60)).await;
        assert_eq!(reaped, 1);
        assert!(mgr.list().await.is_empty());
    }

    #[tokio::test]
    async fn create_rolls_back_on_image_build_failure() {
        let mut cfg = BrokerConfig::default();
        cfg.start_port = 19_600;
        let runtime = Arc::new(FakeRuntimeAdapter::default());
        runtime.fail_build.store(true, std::sync::atomic::Ordering::SeqCst);
        let mgr = ContainerManager::new(Arc::new(cfg), runtime);
        assert!(mgr.create().await.is_err());
        assert!(mgr.list().await.is_empty());
    }
}
