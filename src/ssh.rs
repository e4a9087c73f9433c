//! SSH Transport (C4): opens an SSH connection, negotiates a PTY shell, and
//! exposes a duplex byte stream with resize and close.
//!
//! Wraps the synchronous `ssh2` crate the way the retrieved `nexashell` and
//! `otty` examples do: the blocking connect/handshake/auth sequence runs on
//! `spawn_blocking`, and once the channel is open a dedicated blocking
//! thread polls non-blocking reads and forwards bytes through an mpsc
//! channel to async consumers (the "structured concurrency" shape called
//! for in spec §9: one task owns the blocking I/O, one owns fan-out).

use crate::error::BrokerError;
use async_trait::async_trait;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// PTY modes table reproduced verbatim from the spec (opcode -> value).
pub const PTY_MODES: &[(u8, u32)] = &[
    (1, 0), (2, 0), (3, 0), (4, 0), (5, 0), (6, 0), (7, 0), (8, 0), (9, 0), (10, 1), (11, 0),
    (30, 0), (31, 1), (32, 0), (33, 1), (34, 1), (35, 0), (36, 1), (37, 0), (38, 1), (39, 0),
    (40, 1), (41, 0),
    (50, 1), (51, 1), (52, 0), (53, 1), (54, 1), (55, 1), (56, 1), (57, 0), (58, 1), (59, 1),
    (60, 1), (61, 1), (62, 1),
    (70, 1), (71, 0), (72, 1), (73, 0), (74, 0), (75, 0),
    (90, 19200), (91, 19200),
];

#[derive(Debug, Clone)]
pub struct PtyProfile {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl Default for PtyProfile {
    fn default() -> Self {
        Self {
            term: "xterm-256color".into(),
            cols: 80,
            rows: 24,
            pixel_width: 640,
            pixel_height: 480,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        key_pem: String,
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct SshConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub keepalive_max_miss: u32,
    pub accept_any_host_key: bool,
    pub pty: PtyProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshCloseReason {
    Eof,
    Error,
    KeepaliveTimeout,
}

/// A live SSH shell: output arrives on `output_rx`, the transport closes
/// (once, from either side) and reports on `closed_rx`.
pub struct SshHandle {
    pub transport: Arc<dyn SshTransport>,
    pub output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub closed_rx: oneshot::Receiver<SshCloseReason>,
}

/// The write/resize/close surface of a connected shell. Idempotent close;
/// further writes after close are silently dropped.
pub trait SshTransport: Send + Sync {
    fn write(&self, bytes: &[u8]);
    fn resize(&self, cols: u32, rows: u32, pixel_width: Option<u32>, pixel_height: Option<u32>);
    fn close(&self);
}

#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, params: SshConnectParams) -> Result<SshHandle, BrokerError>;
}

/// Real connector backed by `ssh2`.
pub struct Ssh2Connector;

struct Ssh2Transport {
    input_tx: mpsc::UnboundedSender<ChannelCommand>,
    closed: Arc<AtomicBool>,
}

enum ChannelCommand {
    Write(Vec<u8>),
    Resize(u32, u32, Option<u32>, Option<u32>),
    Close,
}

impl SshTransport for Ssh2Transport {
    fn write(&self, bytes: &[u8]) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.input_tx.send(ChannelCommand::Write(bytes.to_vec()));
    }

    fn resize(&self, cols: u32, rows: u32, pixel_width: Option<u32>, pixel_height: Option<u32>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self
            .input_tx
            .send(ChannelCommand::Resize(cols, rows, pixel_width, pixel_height));
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.input_tx.send(ChannelCommand::Close);
    }
}

#[async_trait]
impl SshConnector for Ssh2Connector {
    async fn connect(&self, params: SshConnectParams) -> Result<SshHandle, BrokerError> {
        let keepalive = params.keepalive;
        let keepalive_max_miss = params.keepalive_max_miss;
        let connect_result = tokio::time::timeout(
            params.connect_timeout,
            tokio::task::spawn_blocking(move || blocking_connect(params)),
        )
        .await;

        let (session, channel) = match connect_result {
            Err(_) => return Err(BrokerError::Timeout),
            Ok(Err(_join_err)) => return Err(BrokerError::Shell("connector task panicked".into())),
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Ok(Ok(pair))) => pair,
        };

        let (output_tx, output_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (input_tx, input_rx) = mpsc::unbounded_channel::<ChannelCommand>();
        let (closed_tx, closed_rx) = oneshot::channel::<SshCloseReason>();
        let closed = Arc::new(AtomicBool::new(false));

        spawn_io_thread(
            session,
            channel,
            output_tx,
            input_rx,
            closed_tx,
            closed.clone(),
            keepalive,
            keepalive_max_miss,
        );

        Ok(SshHandle {
            transport: Arc::new(Ssh2Transport { input_tx, closed }),
            output_rx,
            closed_rx,
        })
    }
}

type BlockingConnectResult = Result<(ssh2::Session, ssh2::Channel), BrokerError>;

fn blocking_connect(params: SshConnectParams) -> BlockingConnectResult {
    let addr = format!("{}:{}", params.host, params.port);
    let tcp = TcpStream::connect(&addr).map_err(classify_connect_io_error)?;
    tcp.set_nodelay(true).ok();

    let mut session = ssh2::Session::new().map_err(|_| BrokerError::Protocol)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(params.connect_timeout.as_millis() as u32);
    session.handshake().map_err(|_| BrokerError::Protocol)?;
    session.set_keepalive(true, params.keepalive.as_secs().max(1) as u32);

    if !params.accept_any_host_key {
        // An operator who disables the unsafe default must supply a real
        // known_hosts check; this crate has no policy beyond "deliberately
        // accept" vs "refuse outright" (spec §9 Open Question).
        return Err(BrokerError::Protocol);
    }

    match &params.auth {
        SshAuth::Password(password) => {
            session
                .userauth_password(&params.username, password)
                .map_err(|_| BrokerError::Auth)?;
        }
        SshAuth::PrivateKey { key_pem, passphrase } => {
            session
                .userauth_pubkey_memory(
                    &params.username,
                    None,
                    key_pem,
                    passphrase.as_deref(),
                )
                .map_err(|_| BrokerError::Auth)?;
        }
    }

    if !session.authenticated() {
        return Err(BrokerError::Auth);
    }

    let mut channel = session
        .channel_session()
        .map_err(|e| BrokerError::Shell(e.to_string()))?;

    let mut modes = ssh2::PtyModes::new();
    for (opcode, value) in PTY_MODES {
        modes.set_u32(*opcode, *value);
    }

    channel
        .request_pty(
            &params.pty.term,
            Some(modes),
            Some((
                params.pty.cols,
                params.pty.rows,
                params.pty.pixel_width,
                params.pty.pixel_height,
            )),
        )
        .map_err(|e| BrokerError::Shell(e.to_string()))?;

    channel
        .shell()
        .map_err(|e| BrokerError::Shell(e.to_string()))?;

    session.set_blocking(false);

    Ok((session, channel))
}

fn classify_connect_io_error(e: std::io::Error) -> BrokerError {
    use std::io::ErrorKind::*;
    match e.kind() {
        ConnectionRefused => BrokerError::NetworkRefused,
        TimedOut => BrokerError::Timeout,
        _ => {
            let msg = e.to_string();
            if msg.contains("unreachable") {
                BrokerError::NetworkUnreachable
            } else if msg.contains("not found") || msg.contains("No such host") {
                BrokerError::NetworkNotFound
            } else {
                BrokerError::Stream(msg)
            }
        }
    }
}

fn spawn_io_thread(
    mut session: ssh2::Session,
    mut channel: ssh2::Channel,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
    mut input_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    closed_tx: oneshot::Sender<SshCloseReason>,
    closed: Arc<AtomicBool>,
    keepalive_interval: Duration,
    keepalive_max_miss: u32,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        let mut last_keepalive = std::time::Instant::now();
        let mut missed_keepalives = 0u32;

        let reason = loop {
            if closed.load(Ordering::SeqCst) {
                break SshCloseReason::Eof;
            }

            while let Ok(cmd) = input_rx.try_recv() {
                match cmd {
                    ChannelCommand::Write(bytes) => {
                        if channel.write_all(&bytes).is_err() {
                            break;
                        }
                        let _ = channel.flush();
                    }
                    ChannelCommand::Resize(cols, rows, pw, ph) => {
                        let _ = channel.request_pty_size(cols, rows, pw, ph);
                    }
                    ChannelCommand::Close => {
                        closed.store(true, Ordering::SeqCst);
                    }
                }
            }
            if closed.load(Ordering::SeqCst) {
                break SshCloseReason::Eof;
            }

            match channel.read(&mut buf) {
                Ok(0) => {
                    if channel.eof() {
                        break SshCloseReason::Eof;
                    }
                }
                Ok(n) => {
                    if output_tx.send(buf[..n].to_vec()).is_err() {
                        break SshCloseReason::Eof;
                    }
                    continue;
                }
                Err(e) if would_block(&e) => {}
                Err(_) => break SshCloseReason::Error,
            }

            if last_keepalive.elapsed() >= keepalive_interval {
                match session.keepalive_send() {
                    Ok(_) => {
                        missed_keepalives = 0;
                    }
                    Err(_) => {
                        missed_keepalives += 1;
                        if missed_keepalives >= keepalive_max_miss {
                            break SshCloseReason::KeepaliveTimeout;
                        }
                    }
                }
                last_keepalive = std::time::Instant::now();
            }

            std::thread::sleep(Duration::from_millis(15));
        };

        let _ = channel.send_eof();
        let _ = channel.wait_close();
        let _ = closed_tx.send(reason);
    });
}

fn would_block(e: &ssh2::Error) -> bool {
    e.code() == ssh2::ErrorCode::Session(-37)
}

/// In-memory fake used by broker tests: simulates a shell that echoes
/// whatever it receives, with knobs to simulate auth/timeout failures.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;

    pub struct FakeSshConnector {
        pub fail_auth: bool,
        pub fail_refused: bool,
        pub delay_before_ready: Option<Duration>,
    }

    impl Default for FakeSshConnector {
        fn default() -> Self {
            Self {
                fail_auth: false,
                fail_refused: false,
                delay_before_ready: None,
            }
        }
    }

    struct FakeTransport {
        echo_tx: mpsc::UnboundedSender<Vec<u8>>,
        closed: Arc<AtomicBool>,
    }

    impl SshTransport for FakeTransport {
        fn write(&self, bytes: &[u8]) {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let _ = self.echo_tx.send(bytes.to_vec());
        }
        fn resize(&self, _cols: u32, _rows: u32, _pw: Option<u32>, _ph: Option<u32>) {}
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SshConnector for FakeSshConnector {
        async fn connect(&self, _params: SshConnectParams) -> Result<SshHandle, BrokerError> {
            if let Some(delay) = self.delay_before_ready {
                tokio::time::sleep(delay).await;
            }
            if self.fail_refused {
                return Err(BrokerError::NetworkRefused);
            }
            if self.fail_auth {
                return Err(BrokerError::Auth);
            }

            let (output_tx, output_rx) = mpsc::unbounded_channel();
            let (closed_tx, closed_rx) = oneshot::channel();
            let closed = Arc::new(AtomicBool::new(false));

            Ok(SshHandle {
                transport: Arc::new(FakeTransport {
                    echo_tx: output_tx,
                    closed: closed.clone(),
                }),
                output_rx,
                closed_rx,
            })
        }
    }
}
