//! The control-channel wire protocol (§6): JSON objects tagged by `type`,
//! carried as binary frames over the persistent connection.

use crate::types::{ExternalSession, Preferences, Schedule, SessionInfo};
use serde::{Deserialize, Serialize};

/// Client -> server control commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Auth {
        token: String,
    },
    #[serde(rename = "preferences:set")]
    PreferencesSet {
        preferences: Preferences,
    },
    #[serde(rename = "session:list")]
    SessionList,
    #[serde(rename = "session:discover")]
    SessionDiscover,
    #[serde(rename = "session:create")]
    SessionCreate {
        cwd: Option<String>,
    },
    #[serde(rename = "session:attach")]
    SessionAttach {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        #[serde(rename = "hasCache")]
        has_cache: bool,
    },
    #[serde(rename = "session:adopt")]
    SessionAdopt {
        pid: u32,
        cwd: String,
    },
    #[serde(rename = "session:destroy")]
    SessionDestroy {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "image:upload")]
    ImageUpload {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        filename: Option<String>,
    },
    #[serde(rename = "schedule:create")]
    ScheduleCreate {
        name: String,
        prompt: String,
        cwd: String,
        preset: String,
    },
    #[serde(rename = "schedule:update")]
    ScheduleUpdate {
        #[serde(rename = "scheduleId")]
        schedule_id: String,
        enabled: Option<bool>,
    },
    #[serde(rename = "schedule:delete")]
    ScheduleDelete {
        #[serde(rename = "scheduleId")]
        schedule_id: String,
    },
    #[serde(rename = "schedule:trigger")]
    ScheduleTrigger {
        #[serde(rename = "scheduleId")]
        schedule_id: String,
    },
    #[serde(rename = "schedule:runs")]
    ScheduleRuns {
        #[serde(rename = "scheduleId")]
        schedule_id: String,
    },
    #[serde(rename = "schedule:log")]
    ScheduleLog {
        #[serde(rename = "scheduleId")]
        schedule_id: String,
        timestamp: String,
    },
    #[serde(rename = "schedule:list")]
    ScheduleList,
}

/// Server -> client control events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename = "auth:success")]
    AuthSuccess { preferences: Preferences },
    #[serde(rename = "auth:failed")]
    AuthFailed { error: String },
    #[serde(rename = "session:list")]
    SessionList { sessions: Vec<SessionInfo> },
    #[serde(rename = "session:discovered")]
    SessionDiscovered { sessions: Vec<ExternalSession> },
    #[serde(rename = "session:created")]
    SessionCreated {
        session: SessionInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        #[serde(rename = "isAdopted")]
        is_adopted: Option<bool>,
    },
    #[serde(rename = "session:attached")]
    SessionAttached { session: SessionInfo },
    #[serde(rename = "session:exit")]
    SessionExit {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    #[serde(rename = "session:destroyed")]
    SessionDestroyed {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "session:status")]
    SessionStatus {
        sessions: Vec<SessionInfo>,
        #[serde(rename = "externalSessions")]
        external_sessions: Vec<ExternalSession>,
    },
    #[serde(rename = "session:input_required")]
    SessionInputRequired {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "sessionName")]
        session_name: String,
        preview: String,
    },
    #[serde(rename = "image:uploaded")]
    ImageUploaded { path: String },
    #[serde(rename = "preferences:updated")]
    PreferencesUpdated { preferences: Preferences },
    #[serde(rename = "schedule:list")]
    ScheduleList { schedules: Vec<Schedule> },
    #[serde(rename = "schedule:updated")]
    ScheduleUpdated {
        #[serde(skip_serializing_if = "Option::is_none")]
        schedule: Option<Schedule>,
        #[serde(skip_serializing_if = "Option::is_none")]
        deleted: Option<String>,
    },
    #[serde(rename = "schedule:runs")]
    ScheduleRuns {
        #[serde(rename = "scheduleId")]
        schedule_id: String,
        runs: Vec<crate::types::RunLogEntry>,
    },
    #[serde(rename = "schedule:log")]
    ScheduleLog {
        #[serde(rename = "scheduleId")]
        schedule_id: String,
        timestamp: String,
        content: String,
    },
    #[serde(rename = "schedule:triggered")]
    ScheduleTriggered {
        #[serde(rename = "scheduleId")]
        schedule_id: String,
    },
    #[serde(rename = "schedule:run_complete")]
    ScheduleRunComplete {
        #[serde(rename = "scheduleId")]
        schedule_id: String,
        name: String,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        timestamp: String,
    },
    Error {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_command_round_trips() {
        let json = r#"{"type":"auth","token":"abcd1234"}"#;
        let cmd: ClientCommand = serde_json::from_str(json).unwrap();
        matches!(cmd, ClientCommand::Auth { token } if token == "abcd1234");
    }

    #[test]
    fn session_attach_defaults_has_cache_false() {
        let json = r#"{"type":"session:attach","sessionId":"abcd1234"}"#;
        let cmd: ClientCommand = serde_json::from_str(json).unwrap();
        match cmd {
            ClientCommand::SessionAttach {
                session_id,
                has_cache,
            } => {
                assert_eq!(session_id, "abcd1234");
                assert!(!has_cache);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn error_event_serializes_to_spec_shape() {
        let event = ServerEvent::Error {
            error: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"], "boom");
    }
}
