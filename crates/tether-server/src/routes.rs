//! Auxiliary HTTP surface (§6): token-guarded collaborator routes that sit
//! alongside the persistent connection — a directory picker, a live-session
//! snapshot, and a best-effort local dev-port scan for the preview feature.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/ports", get(list_ports))
        .route("/api/dirs", get(list_dirs))
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<tether_core::types::SessionInfo>,
    #[serde(rename = "externalSessions")]
    external_sessions: Vec<tether_core::types::ExternalSession>,
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    let mut sessions = Vec::new();
    for session in state.sessions.list().await {
        sessions.push(session.get_info().await);
    }
    let external_sessions = state.sessions.discover_external().await;
    Json(SessionsResponse {
        sessions,
        external_sessions,
    })
}

/// Common dev-server ports, probed by attempting a short-lived local TCP
/// connection. There is no portable way to enumerate listening sockets
/// without a platform-specific syscall, so this is a best-effort scan
/// rather than an authoritative list.
const CANDIDATE_PORTS: &[u16] = &[
    3000, 3001, 3456, 4000, 4200, 5000, 5173, 5174, 8000, 8080, 8081, 8888, 9000,
];

#[derive(Serialize)]
struct PortsResponse {
    ports: Vec<u16>,
}

async fn list_ports() -> Json<PortsResponse> {
    let mut open = Vec::new();
    for &port in CANDIDATE_PORTS {
        let addr = format!("127.0.0.1:{port}");
        let reachable = tokio::time::timeout(Duration::from_millis(150), TcpStream::connect(&addr))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if reachable {
            open.push(port);
        }
    }
    Json(PortsResponse { ports: open })
}

#[derive(Deserialize)]
struct DirsQuery {
    path: Option<String>,
}

#[derive(Serialize)]
struct DirEntryInfo {
    name: String,
    path: String,
    #[serde(rename = "isDir")]
    is_dir: bool,
}

#[derive(Serialize)]
struct DirsResponse {
    path: String,
    entries: Vec<DirEntryInfo>,
}

async fn list_dirs(
    State(_state): State<AppState>,
    Query(query): Query<DirsQuery>,
) -> Response {
    let path = query
        .path
        .unwrap_or_else(|| dirs::home_dir().map(|p| p.to_string_lossy().into_owned()).unwrap_or_else(|| "/".into()));
    let dir = std::path::Path::new(&path);

    if !dir.is_dir() {
        return (StatusCode::BAD_REQUEST, format!("not a directory: {path}")).into_response();
    }

    let read_dir = match std::fs::read_dir(dir) {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let mut entries = Vec::new();
    for entry in read_dir.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        entries.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    Json(DirsResponse { path, entries }).into_response()
}
