//! Scheduler (§4.5): cron-driven headless CLI runs, with jittered delay,
//! run-log persistence, and retention cleanup. Unlike PTY sessions this
//! state does survive restarts — schedules and run logs live on disk.

use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::config;
use tether_core::error::{Result, TetherError};
use tether_core::ids::schedule_id;
use tether_core::protocol::ServerEvent;
use tether_core::security::expand_home;
use tether_core::types::{LastRun, Preset, RunLogEntry, Schedule};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

struct Registration {
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    home: PathBuf,
    binary: PathBuf,
    schedules: Arc<RwLock<HashMap<String, Schedule>>>,
    registrations: Arc<RwLock<HashMap<String, Registration>>>,
    events: broadcast::Sender<ServerEvent>,
}

impl Scheduler {
    pub async fn new(home: PathBuf, binary: PathBuf) -> Result<Self> {
        let (events, _) = broadcast::channel(256);
        std::fs::create_dir_all(&home)?;
        let schedules = load_schedules(&home)?;

        let scheduler = Self {
            home,
            binary,
            schedules: Arc::new(RwLock::new(HashMap::new())),
            registrations: Arc::new(RwLock::new(HashMap::new())),
            events,
        };

        for schedule in schedules {
            let enabled = schedule.enabled;
            let id = schedule.id.clone();
            scheduler.schedules.write().await.insert(id.clone(), schedule);
            if enabled {
                scheduler.register(&id).await;
            }
        }

        sweep_retention(&scheduler.home);
        scheduler.spawn_retention_sweeper();

        Ok(scheduler)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn spawn_retention_sweeper(&self) {
        let home = self.home.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                sweep_retention(&home);
            }
        });
    }

    pub async fn create(&self, name: String, prompt: String, cwd: String, preset_label: &str) -> Result<Schedule> {
        let preset = Preset::from_label(preset_label)
            .ok_or_else(|| TetherError::Validation(format!("unknown preset: {preset_label}")))?;
        let schedule = Schedule::new(schedule_id(), name, prompt, cwd, preset);

        self.schedules
            .write()
            .await
            .insert(schedule.id.clone(), schedule.clone());
        self.persist().await?;
        self.register(&schedule.id).await;
        Ok(schedule)
    }

    pub async fn update(&self, id: &str, enabled: Option<bool>) -> Result<Schedule> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules
            .get_mut(id)
            .ok_or_else(|| TetherError::NotFound(format!("schedule {id}")))?;
        if let Some(enabled) = enabled {
            schedule.enabled = enabled;
        }
        let updated = schedule.clone();
        drop(schedules);

        self.persist().await?;
        if updated.enabled {
            self.register(id).await;
        } else {
            self.unregister(id).await;
        }
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.unregister(id).await;
        self.schedules.write().await.remove(id);
        self.persist().await?;

        let dir = self.home.join("runs").join(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Immediate one-off execution, bypassing the random delay.
    pub async fn trigger(&self, id: &str) -> Result<()> {
        let schedule = self
            .schedules
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TetherError::NotFound(format!("schedule {id}")))?;

        let binary = self.binary.clone();
        let home = self.home.clone();
        let schedules = self.schedules.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            execute_run(binary, home, schedules, events, schedule).await;
        });
        Ok(())
    }

    pub async fn list(&self) -> Vec<Schedule> {
        self.schedules.read().await.values().cloned().collect()
    }

    /// Run log metadata for a schedule, newest first.
    pub async fn list_runs(&self, id: &str) -> Result<Vec<RunLogEntry>> {
        if !self.schedules.read().await.contains_key(id) {
            return Err(TetherError::NotFound(format!("schedule {id}")));
        }
        let dir = self.home.join("runs").join(id);
        let mut entries = Vec::new();
        let Ok(read_dir) = std::fs::read_dir(&dir) else {
            return Ok(entries);
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            if let Some(run_entry) = parse_run_log_entry(id, &path) {
                entries.push(run_entry);
            }
        }
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    pub async fn get_run_log(&self, id: &str, timestamp: &str) -> Result<String> {
        if !self.schedules.read().await.contains_key(id) {
            return Err(TetherError::NotFound(format!("schedule {id}")));
        }
        let path = self.home.join("runs").join(id).join(format!("{timestamp}.log"));
        std::fs::read_to_string(&path)
            .map_err(|_| TetherError::NotFound(format!("run log {timestamp} for schedule {id}")))
    }

    async fn persist(&self) -> Result<()> {
        let schedules: Vec<Schedule> = self.schedules.read().await.values().cloned().collect();
        save_schedules(&self.home, &schedules)
    }

    async fn unregister(&self, id: &str) {
        if let Some(registration) = self.registrations.write().await.remove(id) {
            registration.handle.abort();
        }
    }

    async fn register(&self, id: &str) {
        self.unregister(id).await;

        let Some(schedule) = self.schedules.read().await.get(id).cloned() else {
            return;
        };
        let Ok(cron_schedule) = parse_cron(&schedule.cron_expression) else {
            error!(schedule_id = %id, expr = %schedule.cron_expression, "invalid cron expression");
            return;
        };
        let Some(preset) = Preset::from_label(&schedule.preset_label) else {
            return;
        };

        let binary = self.binary.clone();
        let home = self.home.clone();
        let schedules = self.schedules.clone();
        let events = self.events.clone();
        let id = id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = cron_schedule.upcoming(Utc).next() else {
                    break;
                };
                let now = Utc::now();
                let until_fire = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(until_fire).await;

                let max_delay = preset.max_delay();
                let jitter = if max_delay.as_secs() == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs(rand::thread_rng().gen_range(0..max_delay.as_secs()))
                };
                tokio::time::sleep(jitter).await;

                let schedule = match schedules.read().await.get(&id).cloned() {
                    Some(s) if s.enabled => s,
                    _ => break,
                };
                execute_run(binary.clone(), home.clone(), schedules.clone(), events.clone(), schedule).await;
            }
        });

        self.registrations
            .write()
            .await
            .insert(id, Registration { handle });
    }
}

/// Expand a leading `~` in a schedule's cwd before it reaches `current_dir`;
/// children spawned here get no shell to do it for them.
fn resolve_run_cwd(cwd: &str) -> PathBuf {
    match dirs::home_dir() {
        Some(home) => expand_home(cwd, &home),
        None => PathBuf::from(cwd),
    }
}

fn parse_cron(expr: &str) -> std::result::Result<cron::Schedule, cron::error::Error> {
    let six_field = format!("0 {expr}");
    six_field.parse()
}

async fn execute_run(
    binary: PathBuf,
    home: PathBuf,
    schedules: Arc<RwLock<HashMap<String, Schedule>>>,
    events: broadcast::Sender<ServerEvent>,
    schedule: Schedule,
) {
    let started_at = Utc::now();
    let safe_timestamp = started_at.to_rfc3339().replace(':', "-");
    let run_dir = home.join("runs").join(&schedule.id);
    if let Err(e) = std::fs::create_dir_all(&run_dir) {
        error!(schedule_id = %schedule.id, error = %e, "failed to create run log directory");
        return;
    }
    let log_path = run_dir.join(format!("{safe_timestamp}.log"));

    let mut file = match std::fs::File::create(&log_path) {
        Ok(f) => f,
        Err(e) => {
            error!(schedule_id = %schedule.id, error = %e, "failed to create run log file");
            return;
        }
    };
    let _ = writeln!(file, "# Started: {}", started_at.to_rfc3339());
    let _ = writeln!(file, "# Name: {}", schedule.name);
    let _ = writeln!(file, "# Prompt: {}", schedule.prompt);
    let _ = writeln!(file, "# Cwd: {}", schedule.cwd);
    let _ = writeln!(file, "---");

    let finalized = Arc::new(AtomicBool::new(false));
    let cwd = resolve_run_cwd(&schedule.cwd);

    let spawn_result = Command::new(&binary)
        .arg("-p")
        .arg(&schedule.prompt)
        .current_dir(&cwd)
        .env("FORCE_COLOR", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let exit_code = match spawn_result {
        Ok(mut child) => {
            let mut stdout = child.stdout.take();
            let mut stderr = child.stderr.take();
            let file = Arc::new(std::sync::Mutex::new(file));

            let stdout_file = file.clone();
            let stdout_task = tokio::spawn(async move {
                if let Some(mut s) = stdout.take() {
                    pump(&mut s, &stdout_file).await;
                }
            });
            let stderr_file = file.clone();
            let stderr_task = tokio::spawn(async move {
                if let Some(mut s) = stderr.take() {
                    pump(&mut s, &stderr_file).await;
                }
            });

            let wait_result = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;

            match wait_result {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "child wait error");
                    None
                }
            }
        }
        Err(e) => {
            error!(schedule_id = %schedule.id, error = %e, "failed to spawn schedule run");
            let mut file = file;
            let _ = writeln!(file, "spawn error: {e}");
            None
        }
    };

    finalize_once(
        &finalized,
        &log_path,
        &schedule,
        exit_code,
        started_at,
        &schedules,
        &home,
        &events,
    )
    .await;
}

async fn pump(stream: &mut (impl tokio::io::AsyncRead + Unpin), file: &Arc<std::sync::Mutex<std::fs::File>>) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Ok(mut f) = file.lock() {
                    let _ = f.write_all(&buf[..n]);
                }
            }
            Err(_) => break,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn finalize_once(
    finalized: &Arc<AtomicBool>,
    log_path: &Path,
    schedule: &Schedule,
    exit_code: Option<i32>,
    started_at: chrono::DateTime<Utc>,
    schedules: &Arc<RwLock<HashMap<String, Schedule>>>,
    home: &Path,
    events: &broadcast::Sender<ServerEvent>,
) {
    if finalized.swap(true, Ordering::SeqCst) {
        return;
    }

    let finished_at = Utc::now();
    let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

    if let Ok(mut file) = std::fs::OpenOptions::new().append(true).open(log_path) {
        let _ = writeln!(file, "---");
        let _ = writeln!(file, "# Finished: {}", finished_at.to_rfc3339());
        let _ = writeln!(file, "# Exit code: {}", exit_code.unwrap_or(-1));
        let _ = writeln!(file, "# Duration: {duration_ms}ms");
    }

    let mut guard = schedules.write().await;
    if let Some(stored) = guard.get_mut(&schedule.id) {
        stored.last_run = Some(LastRun {
            timestamp: finished_at,
            exit_code,
            duration_ms,
        });
    }
    let snapshot: Vec<Schedule> = guard.values().cloned().collect();
    drop(guard);

    if let Err(e) = save_schedules(home, &snapshot) {
        error!(schedule_id = %schedule.id, error = %e, "failed to persist schedules after run");
    }

    let _ = events.send(ServerEvent::ScheduleRunComplete {
        schedule_id: schedule.id.clone(),
        name: schedule.name.clone(),
        exit_code,
        timestamp: finished_at.to_rfc3339(),
    });
}

fn parse_run_log_entry(schedule_id: &str, path: &Path) -> Option<RunLogEntry> {
    let content = std::fs::read_to_string(path).ok()?;
    let timestamp = path.file_stem()?.to_str()?.to_string();

    let mut exit_code = None;
    let mut duration_ms = 0u64;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("# Exit code: ") {
            exit_code = rest.trim().parse::<i32>().ok();
        } else if let Some(rest) = line.strip_prefix("# Duration: ") {
            duration_ms = rest.trim_end_matches("ms").trim().parse().unwrap_or(0);
        }
    }

    Some(RunLogEntry {
        schedule_id: schedule_id.to_string(),
        timestamp,
        exit_code,
        duration_ms,
        log_path: path.to_path_buf(),
    })
}

fn load_schedules(home: &Path) -> Result<Vec<Schedule>> {
    let path = config::schedules_path(home);
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(_) => Ok(Vec::new()),
    }
}

fn save_schedules(home: &Path, schedules: &[Schedule]) -> Result<()> {
    std::fs::create_dir_all(home)?;
    let path = config::schedules_path(home);
    let content = serde_json::to_string_pretty(schedules)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Delete run logs older than 7 days and prune now-empty per-schedule dirs.
fn sweep_retention(home: &Path) {
    let runs_dir = config::runs_dir(home);
    let Ok(schedule_dirs) = std::fs::read_dir(&runs_dir) else {
        return;
    };

    let now = std::time::SystemTime::now();
    for schedule_dir in schedule_dirs.flatten() {
        let path = schedule_dir.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(logs) = std::fs::read_dir(&path) else {
            continue;
        };
        let mut remaining = 0;
        for log in logs.flatten() {
            let log_path = log.path();
            let is_old = log
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .map(|age| age > RETENTION)
                .unwrap_or(false);
            if is_old {
                let _ = std::fs::remove_file(&log_path);
            } else {
                remaining += 1;
            }
        }
        if remaining == 0 {
            let _ = std::fs::remove_dir(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_persists_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::new(dir.path().to_path_buf(), PathBuf::from("/bin/echo"))
            .await
            .unwrap();
        let schedule = scheduler
            .create(
                "nightly".into(),
                "do the thing".into(),
                "/tmp".into(),
                "Daily (evening)",
            )
            .await
            .unwrap();
        assert_eq!(schedule.cron_expression, "0 17 * * *");

        let listed = scheduler.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, schedule.id);
    }

    #[tokio::test]
    async fn create_rejects_unknown_preset() {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::new(dir.path().to_path_buf(), PathBuf::from("/bin/echo"))
            .await
            .unwrap();
        let result = scheduler
            .create("x".into(), "y".into(), "/tmp".into(), "Hourly (never)")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delete_removes_run_log_directory() {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::new(dir.path().to_path_buf(), PathBuf::from("/bin/echo"))
            .await
            .unwrap();
        let schedule = scheduler
            .create("a".into(), "b".into(), "/tmp".into(), "Weekly (morning)")
            .await
            .unwrap();

        let run_dir = dir.path().join("runs").join(&schedule.id);
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("2024-01-01T00-00-00.log"), "x").unwrap();

        scheduler.delete(&schedule.id).await.unwrap();
        assert!(!run_dir.exists());
    }

    #[test]
    fn resolve_run_cwd_expands_leading_tilde() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(resolve_run_cwd("~/work"), home.join("work"));
    }

    #[test]
    fn resolve_run_cwd_leaves_absolute_paths_untouched() {
        assert_eq!(resolve_run_cwd("/tmp/work"), PathBuf::from("/tmp/work"));
    }

    #[test]
    fn finalize_guard_only_fires_once() {
        let flag = AtomicBool::new(false);
        assert!(!flag.swap(true, Ordering::SeqCst));
        assert!(flag.swap(true, Ordering::SeqCst));
    }

    #[test]
    fn retention_sweep_deletes_old_logs_and_empty_dirs() {
        let dir = TempDir::new().unwrap();
        let run_dir = dir.path().join("runs").join("abcd1234");
        std::fs::create_dir_all(&run_dir).unwrap();
        let old_log = run_dir.join("old.log");
        std::fs::write(&old_log, "x").unwrap();
        let old_time = std::time::SystemTime::now() - Duration::from_secs(8 * 24 * 60 * 60);
        let file = std::fs::File::open(&old_log).unwrap();
        let _ = file.set_modified(old_time);

        sweep_retention(dir.path());
        assert!(!run_dir.exists());
    }
}
