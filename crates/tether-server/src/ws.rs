//! Session Multiplexer (§4.6): one task per client connection, demultiplexing
//! binary control frames from text PTY frames in both directions.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::Engine as _;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tether_core::error::{Result as TetherResult, TetherError};
use tether_core::protocol::{ClientCommand, ServerEvent};
use tether_core::types::ParsedEvent;
use tether_engine::{output_classifier, PtySession};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth;
use crate::state::AppState;

pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection::new(state, out_tx);

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Binary(bytes) => conn.handle_control(&bytes).await,
            Message::Text(text) => conn.handle_raw_input(text.into_bytes()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    conn.teardown().await;
    writer.abort();
}

struct Attachment {
    session_id: String,
    output_task: JoinHandle<()>,
}

struct Connection {
    state: AppState,
    out_tx: mpsc::UnboundedSender<Message>,
    authenticated: bool,
    attachment: Option<Attachment>,
    broadcast_task: Option<JoinHandle<()>>,
}

impl Connection {
    fn new(state: AppState, out_tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            state,
            out_tx,
            authenticated: false,
            attachment: None,
            broadcast_task: None,
        }
    }

    fn send_event(&self, event: ServerEvent) {
        match serde_json::to_vec(&event) {
            Ok(json) => {
                let _ = self.out_tx.send(Message::Binary(json));
            }
            Err(e) => warn!(error = %e, "failed to serialize control event"),
        }
    }

    async fn handle_control(&mut self, bytes: &[u8]) {
        let cmd: ClientCommand = match serde_json::from_slice(bytes) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.send_event(ServerEvent::Error {
                    error: format!("unrecognized control command: {e}"),
                });
                return;
            }
        };

        if !self.authenticated {
            match cmd {
                ClientCommand::Auth { token } => self.handle_auth(token).await,
                _ => self.send_event(ServerEvent::Error {
                    error: "not authenticated".into(),
                }),
            }
            return;
        }

        if let Err(e) = self.dispatch(cmd).await {
            self.send_event(ServerEvent::Error {
                error: e.to_string(),
            });
        }
    }

    /// Text frames before auth, or without an attached session, are dropped
    /// silently per §4.6.
    async fn handle_raw_input(&self, data: Vec<u8>) {
        if !self.authenticated {
            return;
        }
        let Some(attachment) = &self.attachment else {
            return;
        };
        if let Some(session) = self.state.sessions.get(&attachment.session_id).await {
            let _ = session.write(data).await;
        }
    }

    async fn handle_auth(&mut self, token: String) {
        if auth::token_matches(&self.state, &token) {
            self.authenticated = true;
            let preferences = tether_core::config::Preferences::load(&self.state.preferences_home);
            self.send_event(ServerEvent::AuthSuccess { preferences });
            self.start_broadcast_relay();
        } else {
            self.send_event(ServerEvent::AuthFailed {
                error: "invalid token".into(),
            });
        }
    }

    fn start_broadcast_relay(&mut self) {
        let mut rx = self.state.broadcast_tx.subscribe();
        let out_tx = self.out_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_vec(&event) {
                            if out_tx.send(Message::Binary(json)).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.broadcast_task = Some(handle);
    }

    async fn dispatch(&mut self, cmd: ClientCommand) -> TetherResult<()> {
        match cmd {
            ClientCommand::Auth { token } => {
                self.handle_auth(token).await;
            }
            ClientCommand::PreferencesSet { preferences } => {
                preferences.save(&self.state.preferences_home)?;
                self.send_event(ServerEvent::PreferencesUpdated { preferences });
            }
            ClientCommand::SessionList => {
                let mut sessions = Vec::new();
                for session in self.state.sessions.list().await {
                    sessions.push(session.get_info().await);
                }
                self.send_event(ServerEvent::SessionList { sessions });
            }
            ClientCommand::SessionDiscover => {
                let sessions = self.state.sessions.discover_external().await;
                self.send_event(ServerEvent::SessionDiscovered { sessions });
            }
            ClientCommand::SessionCreate { cwd } => {
                let cwd = cwd.unwrap_or_else(default_cwd);
                let session = self.state.sessions.create(&cwd, &[]).await?;
                self.bind_fresh_session(session, None).await;
            }
            ClientCommand::SessionAttach {
                session_id,
                has_cache,
            } => {
                self.attach(session_id, has_cache).await?;
            }
            ClientCommand::SessionAdopt { pid, cwd } => {
                let session = self.state.sessions.adopt(pid, &cwd).await?;
                self.bind_fresh_session(session, Some(true)).await;
            }
            ClientCommand::SessionDestroy { session_id } => {
                self.state.sessions.destroy(&session_id).await?;
                if self
                    .attachment
                    .as_ref()
                    .is_some_and(|a| a.session_id == session_id)
                {
                    self.detach().await;
                }
                self.send_event(ServerEvent::SessionDestroyed { session_id });
            }
            ClientCommand::Resize { cols, rows } => {
                if let Some(attachment) = &self.attachment {
                    if let Some(session) = self.state.sessions.get(&attachment.session_id).await {
                        let _ = session.resize(cols, rows).await;
                    }
                }
            }
            ClientCommand::ImageUpload {
                data,
                mime_type,
                filename,
            } => {
                let path = self.upload_image(&data, &mime_type, filename)?;
                self.send_event(ServerEvent::ImageUploaded { path });
            }
            ClientCommand::ScheduleCreate {
                name,
                prompt,
                cwd,
                preset,
            } => {
                let schedule = self
                    .state
                    .scheduler
                    .create(name, prompt, cwd, &preset)
                    .await?;
                let _ = self.state.broadcast_tx.send(ServerEvent::ScheduleUpdated {
                    schedule: Some(schedule),
                    deleted: None,
                });
            }
            ClientCommand::ScheduleUpdate {
                schedule_id,
                enabled,
            } => {
                let schedule = self.state.scheduler.update(&schedule_id, enabled).await?;
                let _ = self.state.broadcast_tx.send(ServerEvent::ScheduleUpdated {
                    schedule: Some(schedule),
                    deleted: None,
                });
            }
            ClientCommand::ScheduleDelete { schedule_id } => {
                self.state.scheduler.delete(&schedule_id).await?;
                let _ = self.state.broadcast_tx.send(ServerEvent::ScheduleUpdated {
                    schedule: None,
                    deleted: Some(schedule_id),
                });
            }
            ClientCommand::ScheduleTrigger { schedule_id } => {
                self.state.scheduler.trigger(&schedule_id).await?;
                self.send_event(ServerEvent::ScheduleTriggered { schedule_id });
            }
            ClientCommand::ScheduleRuns { schedule_id } => {
                let runs = self.state.scheduler.list_runs(&schedule_id).await?;
                self.send_event(ServerEvent::ScheduleRuns { schedule_id, runs });
            }
            ClientCommand::ScheduleLog {
                schedule_id,
                timestamp,
            } => {
                let content = self
                    .state
                    .scheduler
                    .get_run_log(&schedule_id, &timestamp)
                    .await?;
                self.send_event(ServerEvent::ScheduleLog {
                    schedule_id,
                    timestamp,
                    content,
                });
            }
            ClientCommand::ScheduleList => {
                let schedules = self.state.scheduler.list().await;
                self.send_event(ServerEvent::ScheduleList { schedules });
            }
        }
        Ok(())
    }

    async fn detach(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment.output_task.abort();
        }
    }

    /// Bind to a session just created or adopted: no history to replay, so
    /// the only ordering requirement is `session:created` before live output.
    async fn bind_fresh_session(&mut self, session: Arc<PtySession>, is_adopted: Option<bool>) {
        self.detach().await;
        let info = session.get_info().await;
        self.send_event(ServerEvent::SessionCreated {
            session: info.clone(),
            is_adopted,
        });
        let (_, rx) = session.subscribe_with_history().await;
        let task = spawn_output_task(session, info.id.clone(), info.cwd, self.out_tx.clone(), rx);
        self.attachment = Some(Attachment {
            session_id: info.id,
            output_task: task,
        });
    }

    async fn attach(&mut self, session_id: String, has_cache: bool) -> TetherResult<()> {
        let session = self
            .state
            .sessions
            .get(&session_id)
            .await
            .ok_or_else(|| TetherError::NotFound(format!("session {session_id}")))?;

        self.detach().await;

        let (history, rx) = session.subscribe_with_history().await;
        let info = session.get_info().await;
        self.send_event(ServerEvent::SessionAttached {
            session: info.clone(),
        });
        if !has_cache && !history.is_empty() {
            let text = String::from_utf8_lossy(&history).into_owned();
            let _ = self.out_tx.send(Message::Text(text));
        }

        let task = spawn_output_task(
            session,
            info.id.clone(),
            info.cwd,
            self.out_tx.clone(),
            rx,
        );
        self.attachment = Some(Attachment {
            session_id: info.id,
            output_task: task,
        });
        Ok(())
    }

    fn upload_image(
        &self,
        data: &str,
        mime_type: &str,
        filename: Option<String>,
    ) -> TetherResult<String> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| TetherError::Validation(format!("invalid base64 image data: {e}")))?;

        let dir = self.state.preferences_home.join("images");
        std::fs::create_dir_all(&dir)?;

        let name = filename.unwrap_or_else(|| {
            format!(
                "{}.{}",
                tether_core::ids::short_id(),
                extension_for_mime(mime_type)
            )
        });
        let path = dir.join(&name);
        std::fs::write(&path, &bytes)?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn teardown(&mut self) {
        self.detach().await;
        if let Some(handle) = self.broadcast_task.take() {
            handle.abort();
        }
    }
}

fn default_cwd() -> String {
    std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "/".into())
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}

/// Stream one session's output to one connection until the session's
/// broadcast channel closes, then emit exactly one `session:exit`.
fn spawn_output_task(
    session: Arc<PtySession>,
    session_id: String,
    cwd: String,
    out_tx: mpsc::UnboundedSender<Message>,
    mut rx: broadcast::Receiver<Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(data) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    if out_tx.send(Message::Text(text.clone())).is_err() {
                        return;
                    }
                    if let ParsedEvent::AskUser { .. } = output_classifier::classify(&text) {
                        let session_name = cwd.rsplit('/').next().unwrap_or(&cwd).to_string();
                        let preview: String = text.chars().take(150).collect();
                        let event = ServerEvent::SessionInputRequired {
                            session_id: session_id.clone(),
                            session_name,
                            preview,
                        };
                        if let Ok(json) = serde_json::to_vec(&event) {
                            let _ = out_tx.send(Message::Binary(json));
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(session_id = %session_id, skipped = n, "output stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        let exit_code = session.exit_code().await.unwrap_or(-1);
        let event = ServerEvent::SessionExit {
            session_id,
            exit_code,
        };
        if let Ok(json) = serde_json::to_vec(&event) {
            let _ = out_tx.send(Message::Binary(json));
        }
    })
}
