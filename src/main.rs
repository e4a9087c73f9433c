//! termbroker entry point.

use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use termbroker::broker::SessionBroker;
use termbroker::config::BrokerConfig;
use termbroker::containers::{ContainerManager, DockerRuntimeAdapter};
use termbroker::http::{router, AppState};
use termbroker::ssh::Ssh2Connector;
use termbroker::supervisor::{shutdown_signal, Supervisor};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Browser-accessible interactive shell broker.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to a JSON config file. Missing file falls back to defaults.
    #[arg(long, env = "CONFIG_PATH", default_value = "termbroker.json")]
    config: String,

    /// Overrides the configured HTTP/WebSocket port.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("termbroker v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut config = BrokerConfig::load(&cli.config).unwrap_or_else(|_| {
        tracing::warn!(path = %cli.config, "config not found, using defaults");
        BrokerConfig::default()
    });
    if let Some(port) = cli.port {
        config.port = port;
    }
    let config = Arc::new(config);

    let runtime = Arc::new(DockerRuntimeAdapter::new(config.runtime_binary.clone()));
    let containers = Arc::new(ContainerManager::new(config.clone(), runtime));
    let broker = Arc::new(SessionBroker::new(
        config.clone(),
        containers.clone(),
        Arc::new(Ssh2Connector),
    ));

    let supervisor = Arc::new(Supervisor::new(config.clone(), broker.clone(), containers.clone()));
    let sweep_handles = supervisor.spawn();

    let state = AppState {
        broker,
        containers,
        started_at: Instant::now(),
    };
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in sweep_handles {
        handle.abort();
    }

    tracing::info!("channel server stopped, running shutdown sweep");
    supervisor.shutdown().await;

    Ok(())
}
