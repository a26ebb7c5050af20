//! Session Manager (§4.4): the registry of live PTY sessions.

use crate::activity_detector::ActivityDetector;
use crate::process_detector::ProcessDetector;
use crate::pty_session::PtySession;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tether_core::error::{Result, TetherError};
use tether_core::ids::short_id;
use tether_core::security::expand_home;
use tether_core::types::ExternalSession;
use tokio::sync::RwLock;
use tracing::info;

pub struct SessionManager {
    binary: std::path::PathBuf,
    binary_name: String,
    sessions: Arc<RwLock<HashMap<String, Arc<PtySession>>>>,
    detector: ProcessDetector,
    activity: ActivityDetector,
}

impl SessionManager {
    pub fn new(binary: std::path::PathBuf, binary_name: impl Into<String>) -> Self {
        let binary_name = binary_name.into();
        let activity_binary_name = binary_name.clone();
        Self {
            binary,
            detector: ProcessDetector::new(binary_name.clone()),
            activity: ActivityDetector::new(move |cwd| {
                project_state_dir(&activity_binary_name, cwd)
            }),
            binary_name,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn create(&self, cwd: &str, args: &[String]) -> Result<Arc<PtySession>> {
        let cwd = resolve_cwd(cwd);
        if !Path::new(&cwd).is_dir() {
            return Err(TetherError::Validation(format!(
                "cwd does not exist or is not a directory: {cwd}"
            )));
        }

        let id = short_id();
        let session = Arc::new(PtySession::spawn(id.clone(), &self.binary, args, &cwd)?);
        self.sessions.write().await.insert(id.clone(), session.clone());
        info!(session_id = %id, cwd, "session created");
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<PtySession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Idempotent: destroying an unknown id is a no-op.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        if let Some(session) = self.sessions.write().await.remove(id) {
            session.stop().await?;
            info!(session_id = %id, "session destroyed");
        }
        Ok(())
    }

    pub async fn destroy_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, v)| v).collect();
        for session in sessions {
            let _ = session.stop().await;
        }
    }

    async fn known_pids(&self) -> Vec<u32> {
        let mut pids = Vec::new();
        for session in self.sessions.read().await.values() {
            if let Some(pid) = session.get_info().await.pid {
                pids.push(pid);
            }
        }
        pids.push(std::process::id());
        pids
    }

    pub async fn discover_external(&self) -> Vec<ExternalSession> {
        let known = self.known_pids().await;
        let mut found = self.detector.discover(&known);
        for session in &mut found {
            session.activity_status = self.activity.status_for(&session.cwd);
        }
        found
    }

    /// Adopt a foreign process: it must appear in a freshly computed
    /// discovery snapshot, which prevents adopting (and killing)
    /// arbitrary processes the client merely claims exist.
    pub async fn adopt(&self, pid: u32, cwd: &str) -> Result<Arc<PtySession>> {
        let discovered = self.discover_external().await;
        let matched = discovered
            .iter()
            .any(|s| s.pid == pid && s.cwd == cwd);
        if !matched {
            return Err(TetherError::Adoption(format!(
                "pid {pid} at {cwd} is not a discovered foreign {} process",
                self.binary_name
            )));
        }

        self.detector.kill(pid)?;
        tokio::time::sleep(Duration::from_millis(150)).await;

        if still_alive(pid) {
            return Err(TetherError::Adoption(format!(
                "process {pid} did not terminate"
            )));
        }

        self.create(cwd, &["--continue".to_string()]).await
    }
}

/// Spawned children get no shell, so a leading `~` must be expanded here
/// before it ever reaches `current_dir`.
fn resolve_cwd(cwd: &str) -> String {
    match dirs::home_dir() {
        Some(home) => expand_home(cwd, &home).to_string_lossy().into_owned(),
        None => cwd.to_string(),
    }
}

/// The target CLI's own per-project state directory, mirroring the
/// `~/.<binary>/projects/<cwd-with-slashes-as-dashes>` layout such CLIs use.
fn project_state_dir(binary_name: &str, cwd: &str) -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let slug: String = cwd.chars().map(|c| if c == '/' { '-' } else { c }).collect();
    Some(home.join(format!(".{binary_name}")).join("projects").join(slug))
}

#[cfg(unix)]
fn still_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn still_alive(pid: u32) -> bool {
    use sysinfo::{Pid, System};
    let mut system = System::new_all();
    system.refresh_all();
    system.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_rejects_nonexistent_cwd() {
        let manager = SessionManager::new(std::path::PathBuf::from("/bin/echo"), "echo");
        let result = manager.create("/no/such/directory", &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn destroy_unknown_id_is_a_no_op() {
        let manager = SessionManager::new(std::path::PathBuf::from("/bin/echo"), "echo");
        assert!(manager.destroy("nonexistent").await.is_ok());
    }

    #[tokio::test]
    async fn adopt_without_discovery_match_fails() {
        let manager = SessionManager::new(std::path::PathBuf::from("/bin/echo"), "echo");
        let result = manager.adopt(999_999, "/tmp").await;
        assert!(result.is_err());
    }

    #[test]
    fn resolve_cwd_expands_leading_tilde() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let expanded = resolve_cwd("~/projects/demo");
        assert_eq!(expanded, home.join("projects/demo").to_string_lossy());
    }

    #[test]
    fn resolve_cwd_leaves_absolute_paths_untouched() {
        assert_eq!(resolve_cwd("/tmp/demo"), "/tmp/demo");
    }
}
