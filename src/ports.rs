//! Port Allocator (C2): hands out free TCP ports on the host and verifies
//! liveness of a remote SSH listener.

use crate::error::PortError;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const MAX_ATTEMPTS: u16 = 1_000;

/// Binds a listening socket starting at `start_port`, incrementing on bind
/// failure, and returns the bound port after releasing the listener.
/// Races are acceptable: a caller that loses the race after close simply
/// fails later and retries via this allocator.
pub async fn allocate(start_port: u16) -> Result<u16, PortError> {
    for offset in 0..MAX_ATTEMPTS {
        let candidate = start_port.saturating_add(offset);
        if candidate == 0 {
            continue;
        }
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", candidate)).await {
            let port = listener
                .local_addr()
                .map(|a| a.port())
                .unwrap_or(candidate);
            drop(listener);
            return Ok(port);
        }
    }
    Err(PortError::ExhaustedRange { start: start_port })
}

/// Polls `host:port` by attempting a TCP connect (2s per-attempt timeout)
/// until one succeeds or the overall `deadline` elapses.
pub async fn await_listener(
    host: &str,
    port: u16,
    deadline: Duration,
    interval: Duration,
) -> Result<(), PortError> {
    let attempts = (deadline.as_secs_f64() / interval.as_secs_f64()).ceil() as u32;
    let attempts = attempts.max(1);

    for _ in 0..attempts {
        let attempt = timeout(
            Duration::from_secs(2),
            TcpStream::connect((host, port)),
        )
        .await;
        if let Ok(Ok(_stream)) = attempt {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
    Err(PortError::Timeout { port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocate_returns_a_bindable_port() {
        let port = allocate(18_000).await.unwrap();
        assert!(port >= 18_000);
        // The port should be free again immediately after allocation.
        let listener = TcpListener::bind(("0.0.0.0", port)).await.unwrap();
        drop(listener);
    }

    #[tokio::test]
    async fn await_listener_succeeds_once_bound() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });
        await_listener(
            "127.0.0.1",
            port,
            Duration::from_secs(3),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn await_listener_times_out_on_closed_port() {
        let result = await_listener(
            "127.0.0.1",
            1, // privileged / almost certainly closed
            Duration::from_millis(200),
            Duration::from_millis(50),
        )
        .await;
        assert!(result.is_err());
    }
}
