//! Broker configuration (§9 policy constants), loaded from JSON with sane
//! defaults, mirroring `EdgeConfig` in the teacher's edge appliance.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Port the admin HTTP + WebSocket server listens on.
    pub port: u16,
    /// First host port tried by the port allocator.
    pub start_port: u16,
    /// Docker (or compatible) runtime CLI binary name.
    pub runtime_binary: String,
    /// Image tag built/used for ad-hoc SSH containers.
    pub image_tag: String,
    /// Fixed root password baked into the built-in image (spec §9: a
    /// convenience for local use only, never randomized here).
    pub container_root_password: String,

    pub min_connect_interval_ms: u64,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub health_sweep_interval_secs: u64,
    pub session_sweep_interval_secs: u64,
    pub container_sweep_interval_secs: u64,
    pub stuck_connecting_timeout_secs: u64,
    pub container_ready_grace_secs: u64,
    pub ssh_keepalive_secs: u64,
    pub ssh_keepalive_max_miss: u32,

    /// Deliberate security weakening (spec §9 Open Question): accept any
    /// SSH host key without verification. Defaults on because the only
    /// built-in flow talks to localhost containers this process itself
    /// created; an operator pointing the broker at arbitrary hosts should
    /// flip this off.
    pub accept_any_host_key: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            start_port: 2222,
            runtime_binary: "docker".into(),
            image_tag: "termbroker-ssh:latest".into(),
            container_root_password: "password123".into(),
            min_connect_interval_ms: 2_000,
            connect_timeout_secs: 30,
            idle_timeout_secs: 30 * 60,
            health_sweep_interval_secs: 60,
            session_sweep_interval_secs: 5 * 60,
            container_sweep_interval_secs: 10 * 60,
            stuck_connecting_timeout_secs: 60,
            container_ready_grace_secs: 2,
            ssh_keepalive_secs: 30,
            ssh_keepalive_max_miss: 3,
            accept_any_host_key: true,
        }
    }
}

impl BrokerConfig {
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn min_connect_interval(&self) -> Duration {
        Duration::from_millis(self.min_connect_interval_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
    pub fn health_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.health_sweep_interval_secs)
    }
    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs)
    }
    pub fn container_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.container_sweep_interval_secs)
    }
    pub fn stuck_connecting_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_connecting_timeout_secs)
    }
    pub fn container_ready_grace(&self) -> Duration {
        Duration::from_secs(self.container_ready_grace_secs)
    }
    pub fn ssh_keepalive(&self) -> Duration {
        Duration::from_secs(self.ssh_keepalive_secs)
    }
}
