//! The monitor session and its transition function
//!
//! `Lifecycle::step` is the only place a [`MonitorSession`] changes. It is a
//! pure function of the current session and one [`Event`]; everything that
//! touches the OS happens in the caller, which feeds the results back in as
//! events and carries out the returned [`Action`]s.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::classifier::Classification;
use crate::publisher::StatusSnapshot;
use crate::state_machine::{Action, Event, ExitReport, Status};

/// Opaque reference to the session's process. Present from the moment a
/// start attempt begins (pid still unknown) until the process leaves the
/// active states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub attempt: u64,
    pub pid: Option<u32>,
    pub spawned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MonitorSession {
    id: Uuid,
    user_id: Option<String>,
    handle: Option<ProcessHandle>,
    /// Last pid this session spawned. Kept after exit for correlation.
    pid: Option<u32>,
    /// The OS has not yet been seen to drop `pid`.
    pid_live: bool,
    /// An exit event for `pid` has been applied.
    exit_confirmed: bool,
    status: Status,
    is_admin_host: bool,
    requires_admin: bool,
    last_error: Option<String>,
    integrated_mode: bool,
    stop_requested: bool,
    in_grace: bool,
    monitors: BTreeMap<String, bool>,
    started_at: Option<DateTime<Utc>>,
}

impl MonitorSession {
    pub fn new(user_id: Option<String>, is_admin_host: bool, requires_admin: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            handle: None,
            pid: None,
            pid_live: false,
            exit_confirmed: false,
            status: Status::NotStarted,
            is_admin_host,
            requires_admin,
            last_error: None,
            integrated_mode: false,
            stop_requested: false,
            in_grace: false,
            monitors: BTreeMap::new(),
            started_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    pub fn last_pid(&self) -> Option<u32> {
        self.pid
    }

    /// The pid that may still be running, active or not.
    pub fn live_pid(&self) -> Option<u32> {
        self.pid.filter(|_| self.pid_live)
    }

    /// The pid of the active process handle, if any.
    pub fn active_pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.pid)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn integrated_mode(&self) -> bool {
        self.integrated_mode
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            running: self.status.is_active(),
            status: self.status,
            admin: self.is_admin_host,
            requires_admin: self.requires_admin,
            last_error: self.last_error.clone(),
            pid: self.active_pid(),
            user_id: self.user_id.clone(),
            integrated_mode: self.integrated_mode,
            session_id: self.id,
            started_at: self.started_at,
            monitors: self.monitors.clone(),
        }
    }

    fn reset_for_restart(&mut self, policy_requires_admin: bool) {
        self.handle = None;
        self.pid = None;
        self.pid_live = false;
        self.exit_confirmed = false;
        self.requires_admin = policy_requires_admin;
        self.last_error = None;
        self.integrated_mode = false;
        self.stop_requested = false;
        self.monitors.clear();
    }

    fn describe_exit(code: Option<i32>, signal: Option<i32>) -> String {
        match (code, signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(sig)) => format!("signal {sig}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }

    fn startup_failure(&mut self, what: &str) {
        self.last_error = Some(match self.last_error.take() {
            Some(prev) => format!("Monitor {what} during startup: {prev}"),
            None => format!("Monitor {what} during startup"),
        });
        self.status = Status::Error;
        self.in_grace = false;
    }

    /// A stop the supervisor asked for has been observed. `stop_requested`
    /// stays set until the exit itself is applied.
    fn finish_requested_stop(&mut self) {
        self.status = Status::Stopped;
        self.user_id = None;
    }
}

/// Owner of the one live [`MonitorSession`].
#[derive(Debug)]
pub struct Lifecycle {
    session: MonitorSession,
    attempt: u64,
    is_admin_host: bool,
    policy_requires_admin: bool,
}

impl Lifecycle {
    pub fn new(is_admin_host: bool, policy_requires_admin: bool) -> Self {
        Self {
            session: MonitorSession::new(None, is_admin_host, policy_requires_admin),
            attempt: 0,
            is_admin_host,
            policy_requires_admin,
        }
    }

    pub fn session(&self) -> &MonitorSession {
        &self.session
    }

    /// Identifier of the current start attempt.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.session.snapshot()
    }

    /// Apply one event. Returns the effects to carry out, `Publish` first
    /// when the visible snapshot changed.
    pub fn step(&mut self, event: Event) -> Vec<Action> {
        let before = self.session.snapshot();
        let mut actions = Vec::new();

        match event {
            Event::StartRequested { user_id, attempt } => self.on_start(user_id, attempt),
            Event::Spawned { attempt, pid } => self.on_spawned(attempt, pid, &mut actions),
            Event::SpawnFailed { attempt, message } => {
                if attempt == self.attempt && self.session.status == Status::Starting {
                    log::error!("Monitor start attempt {attempt} failed: {message}");
                    let s = &mut self.session;
                    s.handle = None;
                    s.in_grace = false;
                    s.status = Status::Error;
                    s.last_error = Some(message);
                }
            }
            Event::Output {
                pid, line, class, ..
            } => self.on_output(pid, line, class),
            Event::Exited { pid, code, signal } => self.on_exited(pid, code, signal, &mut actions),
            Event::GraceElapsed { pid, alive } => {
                if self.session.pid == Some(pid) {
                    if self.session.pid_live && !alive {
                        self.on_liveness_lost(pid);
                    }
                    self.session.in_grace = false;
                }
            }
            Event::LivenessLost { pid } => self.on_liveness_lost(pid),
            Event::StopRequested => {
                let s = &mut self.session;
                if let Some(pid) = s.live_pid()
                    && !s.stop_requested
                {
                    log::info!("Stop requested for monitor pid {pid}");
                    s.stop_requested = true;
                    actions.push(Action::Terminate { pid });
                }
            }
            Event::Abandon { pid } => {
                let s = &mut self.session;
                if s.pid == Some(pid) && s.pid_live {
                    log::error!("Monitor pid {pid} did not confirm its exit; abandoning it");
                    s.pid_live = false;
                    s.handle = None;
                    if s.stop_requested {
                        s.finish_requested_stop();
                    } else if s.status.is_active() {
                        s.status = Status::Crashed;
                    }
                    s.last_error = Some(format!("Monitor process {pid} did not exit when asked"));
                }
            }
            Event::TerminationFailed { pid, message } => {
                if self.session.pid == Some(pid) {
                    self.session.last_error = Some(message);
                }
            }
            Event::InternalFailure { message } => {
                log::error!("Supervisor internal failure: {message}");
                let s = &mut self.session;
                s.handle = None;
                s.in_grace = false;
                s.status = Status::Error;
                s.last_error = Some(message);
            }
        }

        debug_assert_eq!(
            self.session.handle.is_some(),
            self.session.status.is_active(),
            "process handle must exist exactly while the status is active"
        );

        let after = self.session.snapshot();
        if after != before {
            log::info!(
                "monitor → {} (pid: {:?}, user: {:?})",
                after.status,
                self.session.pid,
                after.user_id
            );
            actions.insert(0, Action::Publish);
        }
        actions
    }

    fn on_start(&mut self, user_id: String, attempt: u64) {
        if let Some(pid) = self.session.live_pid() {
            log::warn!("Start attempt {attempt} begins while pid {pid} is still tracked");
        }

        if self.session.user_id.as_deref() == Some(user_id.as_str()) {
            self.session.reset_for_restart(self.policy_requires_admin);
        } else {
            self.session =
                MonitorSession::new(Some(user_id), self.is_admin_host, self.policy_requires_admin);
        }

        self.attempt = attempt;
        let s = &mut self.session;
        s.handle = Some(ProcessHandle {
            attempt,
            pid: None,
            spawned_at: None,
        });
        s.status = Status::Starting;
        s.in_grace = true;
        s.started_at = Some(Utc::now());
    }

    fn on_spawned(&mut self, attempt: u64, pid: u32, actions: &mut Vec<Action>) {
        let s = &mut self.session;
        let current = attempt == self.attempt
            && s.status == Status::Starting
            && s.handle.as_ref().is_some_and(|h| h.pid.is_none());

        if !current {
            log::warn!("Discarding pid {pid} from superseded start attempt {attempt}");
            actions.push(Action::Terminate { pid });
            return;
        }

        s.handle = Some(ProcessHandle {
            attempt,
            pid: Some(pid),
            spawned_at: Some(Utc::now()),
        });
        s.pid = Some(pid);
        s.pid_live = true;
        s.exit_confirmed = false;
        s.status = Status::Initializing;
    }

    fn on_output(&mut self, pid: u32, line: String, class: Classification) {
        let s = &mut self.session;
        if s.pid != Some(pid) || !s.pid_live {
            log::trace!("Ignoring output from stale pid {pid}");
            return;
        }
        if s.stop_requested {
            return;
        }

        match class {
            Classification::Ready => {
                if !s.integrated_mode && matches!(s.status, Status::Starting | Status::Initializing) {
                    s.status = Status::Running;
                }
            }
            Classification::Integrated => {
                if s.handle.is_some() {
                    s.integrated_mode = true;
                    s.status = Status::RunningIntegrated;
                }
            }
            Classification::AdminRequired => {
                s.requires_admin = true;
                if s.status != Status::RequiresAdmin {
                    s.handle = None;
                    s.status = Status::RequiresAdmin;
                    s.last_error = Some(line);
                }
            }
            Classification::Fatal => {
                if s.status != Status::RequiresAdmin {
                    s.handle = None;
                    s.status = Status::Error;
                    s.last_error = Some(line);
                }
            }
            Classification::MonitorReport(entries) => {
                for (name, running) in entries {
                    s.monitors.insert(name, running);
                }
            }
            Classification::Warning => {
                if s.last_error.is_none() {
                    s.last_error = Some(line);
                }
            }
            Classification::Info => {}
        }
    }

    fn on_exited(
        &mut self,
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
        actions: &mut Vec<Action>,
    ) {
        let s = &mut self.session;
        if s.pid != Some(pid) || s.exit_confirmed {
            log::debug!("Ignoring exit of untracked pid {pid}");
            return;
        }

        s.pid_live = false;
        s.exit_confirmed = true;
        s.handle = None;
        let user_id = s.user_id.clone();
        let desc = MonitorSession::describe_exit(code, signal);

        if s.stop_requested {
            s.finish_requested_stop();
            s.stop_requested = false;
        } else if s.integrated_mode {
            // A fatal line already reported from integrated mode stands.
            if s.status != Status::Error {
                s.status = Status::Crashed;
                s.last_error = Some(format!("Integrated monitor exited unexpectedly ({desc})"));
            }
        } else if code == Some(0) {
            s.status = Status::Stopped;
        } else if s.status == Status::RequiresAdmin {
            // Keep the elevation prompt visible.
        } else if s.in_grace {
            s.startup_failure(&format!("exited ({desc})"));
        } else if s.status != Status::Error {
            s.status = Status::Crashed;
            if s.last_error.is_none() {
                s.last_error = Some(format!("Monitor process exited unexpectedly ({desc})"));
            }
        }
        s.in_grace = false;

        actions.push(Action::NotifyExit(ExitReport {
            pid,
            code,
            signal,
            user_id,
            status: s.status,
        }));
    }

    fn on_liveness_lost(&mut self, pid: u32) {
        let s = &mut self.session;
        if s.pid != Some(pid) || !s.pid_live {
            return;
        }
        log::warn!("Monitor pid {pid} is no longer running");

        s.pid_live = false;
        s.handle = None;
        if s.stop_requested {
            s.finish_requested_stop();
        } else if s.in_grace {
            s.startup_failure("exited");
        } else if s.status.is_active() {
            s.status = Status::Crashed;
            s.last_error = Some(format!("Monitor process {pid} is no longer running"));
        }
    }
}
