//! Boundary APIs (C8): the HTTP admin surface, merged with the WebSocket
//! route on one axum `Router` exactly as `portal/backend/src/main.rs`
//! layers `CorsLayer::permissive()` and `TraceLayer` over its routes.

use crate::broker::{SessionBroker, SessionStatus};
use crate::containers::ContainerManager;
use crate::channel::{ws_handler, ContainerRecordWire};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<SessionBroker>,
    pub containers: Arc<ContainerManager>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/containers/create", post(create_container))
        .route("/api/containers/list", get(list_containers))
        .route("/api/containers/stats", get(container_stats))
        .route("/api/containers/:id", delete(delete_container))
        .route("/api/containers/end-session", post(end_session))
        .route("/api/terminal-stats", get(terminal_stats))
        .route("/api/terminal-disconnect", post(terminal_disconnect))
        .route("/api/terminal-health", get(terminal_health))
        .route("/ws/terminal", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": "container-service" }))
}

async fn create_container(State(state): State<AppState>) -> impl IntoResponse {
    match state.containers.create().await {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({ "success": true, "container": ContainerRecordWire::from(&record) })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
    }
}

async fn list_containers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let containers: Vec<ContainerRecordWire> = state
        .containers
        .list()
        .await
        .iter()
        .map(ContainerRecordWire::from)
        .collect();
    Json(json!({ "containers": containers }))
}

#[derive(Serialize)]
struct ContainerStatsWire {
    container_id: String,
    port: u16,
    host: String,
    created_at: chrono::DateTime<chrono::Utc>,
    duration: f64,
    idle_time: f64,
    is_active: bool,
}

async fn container_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats: Vec<ContainerStatsWire> = state
        .containers
        .stats()
        .await
        .into_iter()
        .map(|s| ContainerStatsWire {
            container_id: s.container_id,
            port: s.port,
            host: s.host,
            created_at: s.created_at,
            duration: s.duration.as_secs_f64(),
            idle_time: s.idle_time.as_secs_f64(),
            is_active: s.is_active,
        })
        .collect();
    Json(json!({ "containers": stats }))
}

async fn delete_container(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.containers.stop(&id).await {
        Ok(()) => Json(json!({ "success": true, "message": format!("container {id} stopped") })),
        Err(e) => Json(json!({ "success": false, "message": e.to_string() })),
    }
}

#[derive(Deserialize)]
struct EndSessionRequest {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn end_session(
    State(state): State<AppState>,
    Json(req): Json<EndSessionRequest>,
) -> impl IntoResponse {
    let cleaned = if state.broker.end_session(&req.session_id).await { 1 } else { 0 };
    Json(json!({ "success": true, "containersCleanedUp": cleaned }))
}

async fn terminal_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions: Vec<serde_json::Value> = {
        let mut out = Vec::new();
        for id in state.broker.list_ids() {
            if let Some(record) = state.broker.snapshot(&id).await {
                out.push(json!({
                    "socketId": record.socket_id,
                    "status": status_label(record.status),
                    "containerId": record.container_id,
                    "connectedAt": record.connected_at,
                }));
            }
        }
        out
    };
    let containers: Vec<ContainerRecordWire> = state
        .containers
        .list()
        .await
        .iter()
        .map(ContainerRecordWire::from)
        .collect();
    Json(json!({ "sessions": sessions, "containers": containers }))
}

#[derive(Deserialize)]
struct TerminalDisconnectRequest {
    #[serde(rename = "socketId")]
    socket_id: String,
}

async fn terminal_disconnect(
    State(state): State<AppState>,
    Json(req): Json<TerminalDisconnectRequest>,
) -> impl IntoResponse {
    // Mirrors the `terminal:disconnect` channel event: tears down the SSH
    // transport but never stops the container.
    state.broker.disconnect(&req.socket_id, "manual_disconnect").await;
    Json(json!({ "success": true, "containerStopped": false }))
}

async fn terminal_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let active_sessions = state.broker.list_ids().len();
    Json(json!({
        "status": "healthy",
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "activeSessions": active_sessions,
        "containerService": {
            "status": "healthy",
            "containers": state.containers.list().await.len(),
        }
    }))
}

fn status_label(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Idle => "idle",
        SessionStatus::CreatingContainer => "creating_container",
        SessionStatus::Connecting => "connecting",
        SessionStatus::Connected => "connected",
    }
}
