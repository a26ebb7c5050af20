//! Process Detector (§4.2): finds CLI processes the server didn't spawn,
//! so they can be offered to the client for adoption.

use std::time::Duration;
use sysinfo::{Pid, System};
use tether_core::error::{Result, TetherError};
use tether_core::types::{ActivityStatus, ExternalSession};

pub struct ProcessDetector {
    binary_name: String,
}

impl ProcessDetector {
    pub fn new(binary_name: impl Into<String>) -> Self {
        Self {
            binary_name: binary_name.into(),
        }
    }

    /// Enumerate running processes that look like the target binary and
    /// aren't already tracked by `known_pids`.
    pub fn discover(&self, known_pids: &[u32]) -> Vec<ExternalSession> {
        let mut system = System::new_all();
        system.refresh_all();

        let mut found = Vec::new();
        for (pid, process) in system.processes() {
            let pid_u32 = pid.as_u32();
            if known_pids.contains(&pid_u32) {
                continue;
            }
            if process.thread_kind().is_some() {
                continue;
            }
            let argv = process.cmd();
            let Some(argv0) = argv.first() else {
                continue;
            };
            if !self.matches_binary(argv0) {
                continue;
            }

            let Some(cwd) = process.cwd() else {
                continue;
            };
            let cwd = cwd.to_string_lossy().into_owned();
            if cwd.is_empty() {
                continue;
            }

            found.push(ExternalSession {
                pid: pid_u32,
                cwd,
                command: self.binary_name.clone(),
                args: argv.iter().skip(1).cloned().collect(),
                activity_status: ActivityStatus::Unknown,
            });
        }
        found
    }

    fn matches_binary(&self, argv0: &str) -> bool {
        if argv0.contains(".app/") {
            return false;
        }
        let trailing = argv0.rsplit('/').next().unwrap_or(argv0);
        trailing == self.binary_name
    }

    /// Gracefully then forcefully terminate `pid`, polling for exit.
    pub fn kill(&self, pid: u32) -> Result<()> {
        if !signal_term(pid) {
            return Err(TetherError::Internal(format!(
                "failed to signal process {pid}"
            )));
        }

        for _ in 0..20 {
            std::thread::sleep(Duration::from_millis(50));
            if !is_alive(pid) {
                return Ok(());
            }
        }

        signal_kill(pid);
        std::thread::sleep(Duration::from_millis(50));
        Ok(())
    }
}

#[cfg(unix)]
fn signal_term(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 }
}

#[cfg(unix)]
fn signal_kill(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn signal_term(pid: u32) -> bool {
    let mut system = System::new_all();
    system.refresh_all();
    system
        .process(Pid::from_u32(pid))
        .map(|p| p.kill())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn signal_kill(pid: u32) {
    let _ = signal_term(pid);
}

#[cfg(not(unix))]
fn is_alive(pid: u32) -> bool {
    let mut system = System::new_all();
    system.refresh_all();
    system.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_macos_app_bundle_paths() {
        let detector = ProcessDetector::new("claude");
        assert!(!detector.matches_binary("/Applications/Claude.app/Contents/MacOS/claude"));
    }

    #[test]
    fn matches_exact_name_and_trailing_path_segment() {
        let detector = ProcessDetector::new("claude");
        assert!(detector.matches_binary("claude"));
        assert!(detector.matches_binary("/usr/local/bin/claude"));
        assert!(!detector.matches_binary("/usr/local/bin/claude-helper"));
    }
}
