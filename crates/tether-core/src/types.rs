//! Domain records: sessions, schedules, run logs, and the heuristic output
//! classifier's event shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// §3 Session.status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Stopped,
}

/// §3 Session.activityStatus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Busy,
    Idle,
    Unknown,
}

/// A managed PTY session as seen by clients (no history bytes — those are
/// carried out-of-band as text frames).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub cwd: String,
    pub status: SessionStatus,
    #[serde(rename = "activityStatus")]
    pub activity_status: ActivityStatus,
    pub pid: Option<u32>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// §3 External Session — a foreign instance, discovered not owned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalSession {
    pub pid: u32,
    pub cwd: String,
    pub command: String,
    pub args: Vec<String>,
    #[serde(rename = "activityStatus")]
    pub activity_status: ActivityStatus,
}

/// The fixed, closed set of scheduler presets (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preset {
    DailyMorning,
    DailyAfternoon,
    DailyEvening,
    WeekdaysMorning,
    WeekdaysAfternoon,
    WeekdaysEvening,
    WeeklyMorning,
    WeeklyAfternoon,
    WeeklyEvening,
}

impl Preset {
    pub const ALL: [Preset; 9] = [
        Preset::DailyMorning,
        Preset::DailyAfternoon,
        Preset::DailyEvening,
        Preset::WeekdaysMorning,
        Preset::WeekdaysAfternoon,
        Preset::WeekdaysEvening,
        Preset::WeeklyMorning,
        Preset::WeeklyAfternoon,
        Preset::WeeklyEvening,
    ];

    /// The caller-facing label, e.g. `"Daily (evening)"`.
    pub fn label(&self) -> &'static str {
        match self {
            Preset::DailyMorning => "Daily (morning)",
            Preset::DailyAfternoon => "Daily (afternoon)",
            Preset::DailyEvening => "Daily (evening)",
            Preset::WeekdaysMorning => "Weekdays (morning)",
            Preset::WeekdaysAfternoon => "Weekdays (afternoon)",
            Preset::WeekdaysEvening => "Weekdays (evening)",
            Preset::WeeklyMorning => "Weekly (morning)",
            Preset::WeeklyAfternoon => "Weekly (afternoon)",
            Preset::WeeklyEvening => "Weekly (evening)",
        }
    }

    pub fn from_label(label: &str) -> Option<Preset> {
        Self::ALL.into_iter().find(|p| p.label() == label)
    }

    /// Standard 5-field cron expression for this preset.
    pub fn cron_expression(&self) -> &'static str {
        match self {
            Preset::DailyMorning => "0 7 * * *",
            Preset::DailyAfternoon => "0 12 * * *",
            Preset::DailyEvening => "0 17 * * *",
            Preset::WeekdaysMorning => "0 7 * * 1-5",
            Preset::WeekdaysAfternoon => "0 12 * * 1-5",
            Preset::WeekdaysEvening => "0 17 * * 1-5",
            Preset::WeeklyMorning => "0 7 * * 1",
            Preset::WeeklyAfternoon => "0 12 * * 1",
            Preset::WeeklyEvening => "0 17 * * 1",
        }
    }

    /// Maximum per-firing random delay. Every preset in §4.5 uses 3h.
    pub fn max_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(3 * 60 * 60)
    }
}

/// §3 Schedule.lastRun
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastRun {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

/// §3 Schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub cwd: String,
    #[serde(rename = "presetLabel")]
    pub preset_label: String,
    #[serde(rename = "cronExpression")]
    pub cron_expression: String,
    pub enabled: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastRun")]
    pub last_run: Option<LastRun>,
}

impl Schedule {
    pub fn new(id: String, name: String, prompt: String, cwd: String, preset: Preset) -> Self {
        Self {
            id,
            name,
            prompt,
            cwd,
            preset_label: preset.label().to_string(),
            cron_expression: preset.cron_expression().to_string(),
            enabled: true,
            created_at: Utc::now(),
            last_run: None,
        }
    }
}

/// §3 Run Log — on-disk metadata; the body lives in the file at `log_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    #[serde(rename = "scheduleId")]
    pub schedule_id: String,
    pub timestamp: String,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(rename = "logPath")]
    pub log_path: PathBuf,
}

/// §4.1 heuristic output classification, and the payload each variant
/// carries to the client as a `session:input_required` trigger or plain
/// rendering hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedEvent {
    Text,
    ToolStart { tool_name: String },
    ToolEnd,
    AskUser { options: Vec<AskOption> },
    Diff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskOption {
    pub label: String,
    pub value: String,
}
