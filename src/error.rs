//! Error taxonomy for the broker (spec §7: kind -> source -> client message).

use thiserror::Error;

/// Failure launching or draining an external subprocess (C1).
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {code}: {stderr_tail}")]
    NonZeroExit {
        program: String,
        code: i32,
        stderr_tail: String,
    },
}

/// Failure allocating or awaiting a host port (C2).
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port found starting at {start}")]
    ExhaustedRange { start: u16 },
    #[error("listener on port {port} did not become reachable within the timeout")]
    Timeout { port: u16 },
}

/// Failure inside the container manager (C3).
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("image build failed: {0}")]
    ImageBuild(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("container runtime produced no container id")]
    NoContainerId,
}

/// Failure classification surfaced to the client as `terminal:error` (spec §7).
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    #[error("{0}")]
    Validation(String),
    #[error("Too many connection attempts. Please wait before trying again.")]
    RateLimited,
    #[error("Connection already in progress or established")]
    Busy,
    #[error("Connection refused - check host and port")]
    NetworkRefused,
    #[error("Host unreachable")]
    NetworkUnreachable,
    #[error("Host not found")]
    NetworkNotFound,
    #[error("Connection timeout")]
    Timeout,
    #[error("Authentication failed - check username and password")]
    Auth,
    #[error("Protocol error - incompatible SSH server")]
    Protocol,
    #[error("Shell error: {0}")]
    Shell(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Failed to create container: {0}")]
    ContainerCreate(String),
}

impl From<ContainerError> for BrokerError {
    fn from(e: ContainerError) -> Self {
        BrokerError::ContainerCreate(e.to_string())
    }
}

impl BrokerError {
    /// The exact message sent over the wire in `terminal:error`.
    pub fn client_message(&self) -> String {
        self.to_string()
    }
}
