//! PTY Session Engine (§4.1).
//!
//! Spawns the target CLI inside a pseudoterminal, keeps a bounded in-memory
//! scrollback, and fans output out to every attached client over a broadcast
//! channel. Sessions are purely in-process: nothing here ever touches disk,
//! so there is no recovery path across a server restart (closing the PTY
//! master sends the child SIGHUP, same as closing a real terminal).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;
use tether_core::error::{Result, TetherError};
use tether_core::types::{ActivityStatus, SessionInfo, SessionStatus};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

/// §3: history is capped at 100 KiB, oldest bytes trimmed first.
const HISTORY_CAP: usize = 100 * 1024;

/// §4.1 / testable property 9: busy iff output arrived within this window.
const ACTIVITY_WINDOW: std::time::Duration = std::time::Duration::from_secs(30);

const INITIAL_COLS: u16 = 120;
const INITIAL_ROWS: u16 = 40;

struct History {
    data: VecDeque<u8>,
}

impl History {
    fn new() -> Self {
        Self {
            data: VecDeque::with_capacity(HISTORY_CAP),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.data.extend(bytes.iter().copied());
        while self.data.len() > HISTORY_CAP {
            self.data.pop_front();
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }
}

struct Inner {
    cwd: String,
    pid: Option<u32>,
    status: SessionStatus,
    /// `None` until the first output chunk arrives: a just-spawned session
    /// has no activity to report yet, so it reads as idle, not busy.
    last_activity: Option<Instant>,
    created_at: DateTime<Utc>,
    exit_code: Option<i32>,
}

/// §4.1: busy iff running and output arrived within the last 30s, idle
/// otherwise. A managed session is never `unknown`; that classification
/// only applies to external, undiscoverable processes.
fn derive_activity_status(status: SessionStatus, last_activity: Option<Instant>) -> ActivityStatus {
    let recent = last_activity.is_some_and(|t| t.elapsed() < ACTIVITY_WINDOW);
    if status == SessionStatus::Running && recent {
        ActivityStatus::Busy
    } else {
        ActivityStatus::Idle
    }
}

/// A single managed PTY-backed process.
pub struct PtySession {
    pub id: String,
    input_tx: mpsc::Sender<Vec<u8>>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    output_tx: broadcast::Sender<Bytes>,
    history: Arc<RwLock<History>>,
    inner: Arc<RwLock<Inner>>,
}

impl PtySession {
    /// Spawn `binary` with `args` inside a fresh PTY rooted at `cwd`.
    pub fn spawn(id: String, binary: &std::path::Path, args: &[String], cwd: &str) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: INITIAL_ROWS,
                cols: INITIAL_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TetherError::Spawn(e.to_string()))?;

        let mut builder = CommandBuilder::new(binary);
        for arg in args {
            builder.arg(arg);
        }
        builder.cwd(cwd);
        builder.env("TERM", "xterm-256color");
        builder.env("FORCE_COLOR", "1");

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| TetherError::Spawn(e.to_string()))?;
        let pid = child.process_id();
        drop(pair.slave);

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(256);
        let (resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(16);
        let (output_tx, _) = broadcast::channel::<Bytes>(1024);

        let history = Arc::new(RwLock::new(History::new()));
        let inner = Arc::new(RwLock::new(Inner {
            cwd: cwd.to_string(),
            pid,
            status: SessionStatus::Running,
            last_activity: None,
            created_at: Utc::now(),
            exit_code: None,
        }));

        spawn_io_loop(
            id.clone(),
            pair.master,
            child,
            input_rx,
            resize_rx,
            history.clone(),
            output_tx.clone(),
            inner.clone(),
        );

        Ok(Self {
            id,
            input_tx,
            resize_tx,
            output_tx,
            history,
            inner,
        })
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| TetherError::Internal("session input channel closed".into()))
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.resize_tx
            .send((cols, rows))
            .await
            .map_err(|_| TetherError::Internal("session resize channel closed".into()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    /// Snapshot the current history and subscribe in one step, holding the
    /// history read lock across both so the io loop can't push a chunk to
    /// the broadcast channel in the gap between them (the subscriber would
    /// otherwise either miss it or see it twice on replay).
    pub async fn subscribe_with_history(&self) -> (Vec<u8>, broadcast::Receiver<Bytes>) {
        let history = self.history.read().await;
        let snapshot = history.snapshot();
        let rx = self.output_tx.subscribe();
        (snapshot, rx)
    }

    /// Current scrollback, capped at 100 KiB, for replay on attach.
    pub async fn history(&self) -> Vec<u8> {
        self.history.read().await.snapshot()
    }

    pub async fn get_info(&self) -> SessionInfo {
        let inner = self.inner.read().await;
        SessionInfo {
            id: self.id.clone(),
            cwd: inner.cwd.clone(),
            status: inner.status,
            activity_status: derive_activity_status(inner.status, inner.last_activity),
            pid: inner.pid,
            created_at: inner.created_at,
        }
    }

    pub async fn activity_status(&self) -> ActivityStatus {
        let inner = self.inner.read().await;
        derive_activity_status(inner.status, inner.last_activity)
    }

    pub async fn is_running(&self) -> bool {
        self.inner.read().await.status == SessionStatus::Running
    }

    pub async fn exit_code(&self) -> Option<i32> {
        self.inner.read().await.exit_code
    }

    /// Stop the session: the broadcast sender is dropped when `self` drops,
    /// which is the signal the I/O loop relies on to tear down in tests;
    /// in production the writer end closing triggers the PTY's own exit.
    pub async fn stop(&self) -> Result<()> {
        if let Some(pid) = self.inner.read().await.pid {
            kill_pid(pid);
        }
        Ok(())
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {}

fn spawn_io_loop(
    id: String,
    master: Box<dyn portable_pty::MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    mut resize_rx: mpsc::Receiver<(u16, u16)>,
    history: Arc<RwLock<History>>,
    output_tx: broadcast::Sender<Bytes>,
    inner: Arc<RwLock<Inner>>,
) {
    let reader = match master.try_clone_reader() {
        Ok(r) => r,
        Err(e) => {
            warn!(session_id = %id, error = %e, "failed to clone pty reader");
            return;
        }
    };
    let writer = match master.take_writer() {
        Ok(w) => w,
        Err(e) => {
            warn!(session_id = %id, error = %e, "failed to take pty writer");
            return;
        }
    };

    let writer_id = id.clone();
    tokio::task::spawn_blocking(move || {
        let mut writer = writer;
        while let Some(data) = input_rx.blocking_recv() {
            if writer.write_all(&data).is_err() || writer.flush().is_err() {
                debug!(session_id = %writer_id, "pty writer closed");
                break;
            }
        }
    });

    let (reader_tx, mut reader_rx) = mpsc::channel::<std::io::Result<Bytes>>(256);
    tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if reader_tx
                        .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let _ = reader_tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let child = Arc::new(std::sync::Mutex::new(Some(child)));
        loop {
            tokio::select! {
                msg = reader_rx.recv() => {
                    match msg {
                        Some(Ok(data)) => {
                            history.write().await.push(&data);
                            inner.write().await.last_activity = Some(Instant::now());
                            let _ = output_tx.send(data);
                        }
                        Some(Err(e)) => {
                            debug!(session_id = %id, error = %e, "pty read error");
                            break;
                        }
                        None => break,
                    }
                }
                Some((cols, rows)) = resize_rx.recv() => {
                    let _ = master.resize(PtySize { cols, rows, pixel_width: 0, pixel_height: 0 });
                }
            }
        }

        let exit_code = {
            let child = child.clone();
            tokio::task::spawn_blocking(move || {
                let mut guard = child.lock().unwrap();
                guard
                    .take()
                    .and_then(|mut c| c.wait().ok())
                    .map(|status| status.exit_code() as i32)
            })
            .await
            .unwrap_or(None)
        };

        let mut guard = inner.write().await;
        guard.status = SessionStatus::Stopped;
        guard.exit_code = exit_code;
        guard.pid = None;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn freshly_created_session_with_no_output_yet_is_idle() {
        let status = derive_activity_status(SessionStatus::Running, None);
        assert_eq!(status, ActivityStatus::Idle);
    }

    #[test]
    fn recent_output_on_running_session_is_busy() {
        let status = derive_activity_status(SessionStatus::Running, Some(Instant::now()));
        assert_eq!(status, ActivityStatus::Busy);
    }

    #[test]
    fn stale_output_on_running_session_is_idle() {
        let old = Instant::now() - (ACTIVITY_WINDOW + Duration::from_secs(1));
        let status = derive_activity_status(SessionStatus::Running, Some(old));
        assert_eq!(status, ActivityStatus::Idle);
    }

    #[test]
    fn stopped_session_is_idle_even_with_recent_output() {
        let status = derive_activity_status(SessionStatus::Stopped, Some(Instant::now()));
        assert_eq!(status, ActivityStatus::Idle);
    }

    #[tokio::test]
    async fn history_is_trimmed_to_cap() {
        let mut history = History::new();
        let chunk = vec![b'x'; HISTORY_CAP / 4];
        for _ in 0..6 {
            history.push(&chunk);
        }
        assert!(history.snapshot().len() <= HISTORY_CAP);
    }

    #[tokio::test]
    async fn echo_session_produces_output_and_exits() {
        let session = PtySession::spawn(
            "test".into(),
            std::path::Path::new("/bin/echo"),
            &["hello-tether".into()],
            "/tmp",
        )
        .expect("spawn echo");

        let mut rx = session.subscribe();
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Ok(bytes)) => collected.extend_from_slice(&bytes),
                _ => {
                    if !session.is_running().await {
                        break;
                    }
                }
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("hello-tether"));
    }
}
