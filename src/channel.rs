//! Client Channel (C5): a persistent bidirectional message channel to the
//! browser, carrying the typed event vocabulary of spec §6 over a JSON
//! envelope on an axum WebSocket, grounded in `portal/backend/src/ws.rs`'s
//! `handle_socket` shape (a `tokio::select!` loop over a ticker and
//! `socket.recv()`).

use crate::broker::Credentials;
use crate::containers::ContainerRecord;
use crate::ssh::SshAuth;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::Engine;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use uuid::Uuid;

use crate::http::AppState;

/// Events the browser may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "terminal:connect")]
    Connect(ConnectCredentialsWire),
    #[serde(rename = "terminal:create-container")]
    CreateContainer,
    #[serde(rename = "terminal:input")]
    Input { bytes_b64: String },
    #[serde(rename = "terminal:resize")]
    Resize {
        cols: u32,
        rows: u32,
        width: Option<u32>,
        height: Option<u32>,
    },
    #[serde(rename = "terminal:disconnect")]
    Disconnect,
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "authType", rename_all = "camelCase")]
pub enum ConnectCredentialsWire {
    #[serde(rename = "password")]
    Password {
        host: String,
        port: u16,
        username: String,
        password: String,
    },
    #[serde(rename = "privateKey")]
    PrivateKey {
        host: String,
        port: u16,
        username: String,
        #[serde(rename = "privateKey")]
        private_key: String,
        passphrase: Option<String>,
    },
}

impl From<ConnectCredentialsWire> for Credentials {
    fn from(wire: ConnectCredentialsWire) -> Self {
        match wire {
            ConnectCredentialsWire::Password {
                host,
                port,
                username,
                password,
            } => Credentials {
                host,
                port,
                username,
                auth: SshAuth::Password(password),
            },
            ConnectCredentialsWire::PrivateKey {
                host,
                port,
                username,
                private_key,
                passphrase,
            } => Credentials {
                host,
                port,
                username,
                auth: SshAuth::PrivateKey {
                    key_pem: private_key,
                    passphrase,
                },
            },
        }
    }
}

/// Events the server may send.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "terminal:container-creating")]
    ContainerCreating { message: String },
    #[serde(rename = "terminal:container-created")]
    ContainerCreated(ContainerRecordWire),
    #[serde(rename = "terminal:connected")]
    Connected {
        host: String,
        port: u16,
        username: String,
        container_id: Option<String>,
    },
    #[serde(rename = "terminal:output")]
    Output { bytes_b64: String },
    #[serde(rename = "terminal:error")]
    Error { message: String },
    #[serde(rename = "terminal:disconnected")]
    Disconnected { reason: String },
    #[serde(rename = "pong")]
    Pong,
}

#[derive(Debug, Serialize, Clone)]
pub struct ContainerRecordWire {
    pub container_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&ContainerRecord> for ContainerRecordWire {
    fn from(r: &ContainerRecord) -> Self {
        Self {
            container_id: r.container_id.clone(),
            host: r.host.clone(),
            port: r.port,
            username: r.username.clone(),
            created_at: r.created_at,
        }
    }
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_bytes(s: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .unwrap_or_default()
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let socket_id = Uuid::new_v4().to_string();
    let alive = Arc::new(AtomicBool::new(true));
    let mut events_rx = state.broker.register(&socket_id, alive.clone());

    let (mut sink, mut stream) = futures_util::StreamExt::split(socket);
    let mut keepalive = interval(Duration::from_secs(30));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            event = events_rx.recv() => {
                match event {
                    Some(ev) => {
                        let text = serde_json::to_string(&ev).unwrap_or_default();
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = futures_util::StreamExt::next(&mut stream) => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(&state, &socket_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    state
        .broker
        .destroy_session(&socket_id, "client_disconnect")
        .await;
}

async fn handle_client_text(state: &AppState, socket_id: &str, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(_) => return,
    };

    match event {
        ClientEvent::Connect(wire) => {
            let _ = state.broker.connect(socket_id, wire.into()).await;
        }
        ClientEvent::CreateContainer => {
            let _ = state.broker.create_container(socket_id).await;
        }
        ClientEvent::Input { bytes_b64 } => {
            let bytes = decode_bytes(&bytes_b64);
            state.broker.input(socket_id, &bytes).await;
        }
        ClientEvent::Resize {
            cols,
            rows,
            width,
            height,
        } => {
            state.broker.resize(socket_id, cols, rows, width, height).await;
        }
        ClientEvent::Disconnect => {
            state.broker.disconnect(socket_id, "user_disconnect").await;
        }
        ClientEvent::Ping => {
            state.broker.pong(socket_id);
        }
    }
}
