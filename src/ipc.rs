//! Newline-delimited JSON spoken with the UI process over stdin/stdout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::publisher::{OutputLine, StatusSnapshot};
use crate::state_machine::ExitReport;
use crate::supervisor::CommandOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cmd {
    Start,
    Stop,
    Status,
    Shutdown,
}

/// `{"cmd":"start","userId":"u1","id":7}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Opaque correlation id, echoed in the reply.
    #[serde(default)]
    pub id: Option<Value>,
    pub cmd: Cmd,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Request {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Everything written to stdout, one JSON object per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Evt {
    Status {
        #[serde(flatten)]
        snapshot: StatusSnapshot,
        ts: DateTime<Utc>,
    },
    Output {
        #[serde(flatten)]
        line: OutputLine,
        ts: DateTime<Utc>,
    },
    Exited {
        #[serde(flatten)]
        report: ExitReport,
        ts: DateTime<Utc>,
    },
    Reply {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        success: bool,
        message: String,
        status: StatusSnapshot,
        ts: DateTime<Utc>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        message: String,
        ts: DateTime<Utc>,
    },
}

impl Evt {
    pub fn status(snapshot: &StatusSnapshot) -> Self {
        Evt::Status {
            snapshot: snapshot.clone(),
            ts: Utc::now(),
        }
    }

    pub fn output(line: &OutputLine) -> Self {
        Evt::Output {
            line: line.clone(),
            ts: Utc::now(),
        }
    }

    pub fn exited(report: &ExitReport) -> Self {
        Evt::Exited {
            report: report.clone(),
            ts: Utc::now(),
        }
    }

    pub fn reply(id: Option<Value>, outcome: CommandOutcome) -> Self {
        Evt::Reply {
            id,
            success: outcome.success,
            message: outcome.message,
            status: outcome.status,
            ts: Utc::now(),
        }
    }

    pub fn error(id: Option<Value>, message: impl Into<String>) -> Self {
        Evt::Error {
            id,
            message: message.into(),
            ts: Utc::now(),
        }
    }

    /// Serialise as a single line, without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use uuid::Uuid;

    use super::*;
    use crate::state_machine::{Status, StreamKind};

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            running: true,
            status: Status::Running,
            admin: false,
            requires_admin: true,
            last_error: None,
            pid: Some(4242),
            user_id: Some("u1".into()),
            integrated_mode: false,
            session_id: Uuid::nil(),
            started_at: None,
            monitors: BTreeMap::new(),
        }
    }

    #[test]
    fn parses_requests() {
        let req = Request::parse(r#"{"cmd":"start","userId":"u1","id":3}"#).unwrap();
        assert_eq!(req.cmd, Cmd::Start);
        assert_eq!(req.user_id.as_deref(), Some("u1"));
        assert_eq!(req.id, Some(Value::from(3)));

        let req = Request::parse(r#"{"cmd":"stop"}"#).unwrap();
        assert_eq!(req.cmd, Cmd::Stop);
        assert_eq!(req.id, None);

        assert!(Request::parse(r#"{"cmd":"reboot"}"#).is_err());
        assert!(Request::parse("not json").is_err());
    }

    #[test]
    fn status_message_is_flat() {
        let json: Value = serde_json::from_str(&Evt::status(&snapshot()).to_line().unwrap()).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["running"], true);
        assert_eq!(json["requiresAdmin"], true);
        assert_eq!(json["pid"], 4242);
        assert!(json["ts"].is_string());
    }

    #[test]
    fn output_and_exit_messages() {
        let line = OutputLine {
            pid: 9,
            stream: StreamKind::Stderr,
            line: "oops".into(),
        };
        let json: Value = serde_json::to_value(Evt::output(&line)).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["stream"], "stderr");
        assert_eq!(json["line"], "oops");

        let report = ExitReport {
            pid: 9,
            code: Some(1),
            signal: None,
            user_id: Some("u1".into()),
            status: Status::Crashed,
        };
        let json: Value = serde_json::to_value(Evt::exited(&report)).unwrap();
        assert_eq!(json["type"], "exited");
        assert_eq!(json["code"], 1);
        assert_eq!(json["signal"], Value::Null);
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["status"], "crashed");
    }

    #[test]
    fn reply_echoes_the_request_id() {
        let outcome = CommandOutcome {
            success: false,
            message: "no usable interpreter found".into(),
            status: snapshot(),
        };
        let json: Value =
            serde_json::to_value(Evt::reply(Some(Value::from("abc")), outcome)).unwrap();
        assert_eq!(json["type"], "reply");
        assert_eq!(json["id"], "abc");
        assert_eq!(json["success"], false);
        assert_eq!(json["status"]["status"], "running");

        let json: Value = serde_json::to_value(Evt::error(None, "bad request")).unwrap();
        assert_eq!(json["type"], "error");
        assert!(json.get("id").is_none());
    }
}
