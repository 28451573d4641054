//! Tagged types fed into and emitted by `Lifecycle::step`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classifier::Classification;

/// Monitor process status as reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    NotStarted,
    Starting,
    Initializing,
    Running,
    RunningIntegrated,
    Stopped,
    Crashed,
    Error,
    RequiresAdmin,
}

impl Status {
    /// States in which the session holds a live process handle.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Status::Starting | Status::Initializing | Status::Running | Status::RunningIntegrated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotStarted => "not-started",
            Status::Starting => "starting",
            Status::Initializing => "initializing",
            Status::Running => "running",
            Status::RunningIntegrated => "running-integrated",
            Status::Stopped => "stopped",
            Status::Crashed => "crashed",
            Status::Error => "error",
            Status::RequiresAdmin => "requires-admin",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        })
    }
}

/// Everything that can move the session. Events that concern a process
/// carry its pid (or start attempt) so stale ones can be discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StartRequested { user_id: String, attempt: u64 },
    Spawned { attempt: u64, pid: u32 },
    SpawnFailed { attempt: u64, message: String },
    Output {
        pid: u32,
        stream: StreamKind,
        line: String,
        class: Classification,
    },
    Exited {
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The post-spawn grace window closed; `alive` is the probe result.
    GraceElapsed { pid: u32, alive: bool },
    /// The OS no longer knows the tracked pid.
    LivenessLost { pid: u32 },
    StopRequested,
    /// Abandon a process that did not confirm its exit in time.
    Abandon { pid: u32 },
    TerminationFailed { pid: u32, message: String },
    InternalFailure { message: String },
}

/// Side effects the owner of the lifecycle must carry out after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Snapshot changed; push it to status subscribers.
    Publish,
    /// The OS reported the process gone.
    NotifyExit(ExitReport),
    /// Ask the termination controller to stop this pid.
    Terminate { pid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: Status,
}
