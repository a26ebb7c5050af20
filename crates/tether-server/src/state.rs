//! Shared application state handed to every axum handler.

use std::sync::Arc;
use tether_core::protocol::ServerEvent;
use tether_engine::{Scheduler, SessionManager};
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub scheduler: Arc<Scheduler>,
    pub auth_token: Arc<str>,
    pub preferences_home: std::path::PathBuf,
    /// Fan-out for the periodic status broadcast and scheduler run-complete
    /// events; every authenticated connection subscribes on attach.
    pub broadcast_tx: broadcast::Sender<ServerEvent>,
}
