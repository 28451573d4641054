//! The monitor supervisor
//!
//! One Tokio task (the event loop) owns the [`Lifecycle`] and is the only
//! code that mutates the session. Everything else talks to it through an
//! unbounded channel:
//!
//! - stream pumps send classified output lines,
//! - the exit watcher sends the OS exit status once the pipes have drained,
//! - termination tasks report failures,
//! - the public [`Supervisor`] handle sends start/stop/status requests and
//!   waits on oneshot replies.
//!
//! Start and stop orchestration is serialised by an async gate so that at
//! most one child is ever being brought up or torn down at a time.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::classifier::{Classification, Classifier, LineBuffer};
use crate::config::{SupervisorConfig, Timeouts};
use crate::error::{Result, SupervisorError};
use crate::launcher::{self, LaunchedProcess};
use crate::lifecycle::Lifecycle;
use crate::platform;
use crate::privilege;
use crate::publisher::{OutputLine, Publisher, StatusSnapshot, SubscriptionId};
use crate::state_machine::{Action, Event, ExitReport, Status, StreamKind};
use crate::terminate;

const READ_CHUNK: usize = 8 * 1024;

/// Result handed back to callers of `start`/`stop`. Never an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
    pub status: StatusSnapshot,
}

impl CommandOutcome {
    fn ok(message: impl Into<String>, status: StatusSnapshot) -> Self {
        Self {
            success: true,
            message: message.into(),
            status,
        }
    }

    fn failed(message: impl Into<String>, status: StatusSnapshot) -> Self {
        Self {
            success: false,
            message: message.into(),
            status,
        }
    }
}

enum Begin {
    Proceed { attempt: u64 },
    AlreadyRunning(StatusSnapshot),
    /// Another process is still live and must be stopped first.
    Busy { pid: u32 },
}

enum Msg {
    Event(Event),
    Begin {
        user_id: String,
        force: bool,
        reply: oneshot::Sender<Begin>,
    },
    Stop {
        reply: oneshot::Sender<Option<u32>>,
    },
    Query {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    /// Replies with the snapshot and whether a stop is already under way.
    GraceCheck {
        pid: u32,
        reply: oneshot::Sender<(StatusSnapshot, bool)>,
    },
    AwaitExit {
        pid: u32,
        reply: oneshot::Sender<()>,
    },
}

struct EventLoop {
    rx: mpsc::UnboundedReceiver<Msg>,
    tx: mpsc::WeakUnboundedSender<Msg>,
    lifecycle: Lifecycle,
    publisher: Arc<Publisher>,
    status_tx: watch::Sender<StatusSnapshot>,
    timeouts: Timeouts,
    attempt: u64,
    exit_waiters: Vec<(u32, oneshot::Sender<()>)>,
}

impl EventLoop {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg);
        }
        log::debug!("Supervisor event loop exiting");
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Event(event) => self.apply(event),
            Msg::Begin {
                user_id,
                force,
                reply,
            } => {
                let begin = self.begin(user_id, force);
                let _ = reply.send(begin);
            }
            Msg::Stop { reply } => {
                let pid = self.lifecycle.session().live_pid();
                self.apply(Event::StopRequested);
                let _ = reply.send(pid);
            }
            Msg::Query { reply } => {
                self.reconcile();
                let _ = reply.send(self.lifecycle.snapshot());
            }
            Msg::GraceCheck { pid, reply } => {
                let alive = platform::is_alive(pid);
                self.apply(Event::GraceElapsed { pid, alive });
                let stopping = self.lifecycle.session().stop_requested();
                let _ = reply.send((self.lifecycle.snapshot(), stopping));
            }
            Msg::AwaitExit { pid, reply } => {
                if self.lifecycle.session().live_pid() == Some(pid) {
                    self.exit_waiters.push((pid, reply));
                } else {
                    let _ = reply.send(());
                }
            }
        }
    }

    fn begin(&mut self, user_id: String, force: bool) -> Begin {
        let session = self.lifecycle.session();
        if let Some(pid) = session.live_pid() {
            if force {
                self.apply(Event::Abandon { pid });
            } else if session.user_id() == Some(user_id.as_str())
                && session.status().is_active()
                && !session.stop_requested()
            {
                return Begin::AlreadyRunning(self.lifecycle.snapshot());
            } else {
                return Begin::Busy { pid };
            }
        }

        self.attempt += 1;
        let attempt = self.attempt;
        self.apply(Event::StartRequested { user_id, attempt });
        Begin::Proceed { attempt }
    }

    /// Probe the tracked pid and fold a disagreement back into the session.
    fn reconcile(&mut self) {
        if let Some(pid) = self.lifecycle.session().live_pid()
            && !platform::is_alive(pid)
        {
            self.apply(Event::LivenessLost { pid });
        }
    }

    fn apply(&mut self, event: Event) {
        if let Event::Output {
            pid, stream, line, ..
        } = &event
        {
            self.publisher.publish_output(&OutputLine {
                pid: *pid,
                stream: *stream,
                line: line.clone(),
            });
        }

        for action in self.lifecycle.step(event) {
            match action {
                Action::Publish => {
                    let snapshot = self.lifecycle.snapshot();
                    self.status_tx.send_replace(snapshot.clone());
                    self.publisher.publish_status(&snapshot);
                }
                Action::NotifyExit(report) => self.notify_exit(&report),
                Action::Terminate { pid } => self.spawn_terminate(pid),
            }
        }

        let live = self.lifecycle.session().live_pid();
        let (exited, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.exit_waiters)
            .into_iter()
            .partition(|(pid, _)| live != Some(*pid));
        self.exit_waiters = pending;
        for (_, waiter) in exited {
            let _ = waiter.send(());
        }
    }

    fn notify_exit(&mut self, report: &ExitReport) {
        log::info!(
            "Monitor pid {} exited (code: {:?}, signal: {:?}) → {}",
            report.pid,
            report.code,
            report.signal,
            report.status
        );
        self.publisher.publish_exit(report);
    }

    fn spawn_terminate(&self, pid: u32) {
        let timeouts = self.timeouts.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(e) = terminate::stop(pid, &timeouts).await {
                log::error!("Failed to stop monitor pid {pid}: {e}");
                if let Some(tx) = tx.upgrade() {
                    let _ = tx.send(Msg::Event(Event::TerminationFailed {
                        pid,
                        message: e.to_string(),
                    }));
                }
            }
        });
    }
}

/// Cloneable handle to the supervisor event loop.
#[derive(Clone)]
pub struct Supervisor {
    tx: mpsc::UnboundedSender<Msg>,
    status_rx: watch::Receiver<StatusSnapshot>,
    publisher: Arc<Publisher>,
    classifier: Arc<Classifier>,
    config: Arc<SupervisorConfig>,
    is_admin_host: bool,
    gate: Arc<Mutex<()>>,
}

impl Supervisor {
    /// Spawn the event loop on the current Tokio runtime. Host elevation is
    /// queried once per process.
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_elevation(config, privilege::host_is_elevated())
    }

    pub fn with_elevation(config: SupervisorConfig, is_admin_host: bool) -> Self {
        let requires_admin = privilege::admin_required_by_policy(&config);
        let lifecycle = Lifecycle::new(is_admin_host, requires_admin);
        let (status_tx, status_rx) = watch::channel(lifecycle.snapshot());
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = Arc::new(Publisher::new());

        let event_loop = EventLoop {
            rx,
            tx: tx.downgrade(),
            lifecycle,
            publisher: Arc::clone(&publisher),
            status_tx,
            timeouts: config.timeouts.clone(),
            attempt: 0,
            exit_waiters: Vec::new(),
        };
        tokio::spawn(event_loop.run());

        log::info!(
            "Supervisor ready (elevated: {is_admin_host}, admin required: {requires_admin})"
        );

        Self {
            tx,
            status_rx,
            publisher,
            classifier: Arc::new(Classifier::new(config.markers.clone())),
            config: Arc::new(config),
            is_admin_host,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn is_admin_host(&self) -> bool {
        self.is_admin_host
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Msg) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| SupervisorError::Disconnected)?;
        rx.await.map_err(|_| SupervisorError::Disconnected)
    }

    fn send(&self, event: Event) -> Result<()> {
        self.tx
            .send(Msg::Event(event))
            .map_err(|_| SupervisorError::Disconnected)
    }

    /// Start monitoring for `user_id`. A different user's monitor is stopped
    /// (and its exit awaited, bounded) first; an empty id means `stop`.
    /// Resolves after the post-spawn grace window.
    pub async fn start(&self, user_id: &str) -> CommandOutcome {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return self.stop().await;
        }

        self.guarded(self.start_inner(user_id)).await
    }

    /// Fold errors and panics from an orchestration future into a failed
    /// outcome and an `error` status.
    async fn guarded<F>(&self, fut: F) -> CommandOutcome
    where
        F: Future<Output = Result<CommandOutcome>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => self.fail_internal(e).await,
            Err(panic) => {
                self.fail_internal(SupervisorError::Internal(panic_message(&*panic)))
                    .await
            }
        }
    }

    async fn start_inner(&self, user_id: &str) -> Result<CommandOutcome> {
        let timeouts = &self.config.timeouts;

        let pid = {
            let _gate = self.gate.lock().await;

            let mut force = false;
            let attempt = loop {
                let begin = self
                    .request(|reply| Msg::Begin {
                        user_id: user_id.to_string(),
                        force,
                        reply,
                    })
                    .await?;

                match begin {
                    Begin::Proceed { attempt } => break attempt,
                    Begin::AlreadyRunning(snapshot) => {
                        return Ok(CommandOutcome::ok("Monitor already running", snapshot));
                    }
                    Begin::Busy { pid } => {
                        log::info!("Stopping monitor pid {pid} before starting for {user_id}");
                        self.send(Event::StopRequested)?;
                        let confirmed = tokio::time::timeout(
                            timeouts.confirm_timeout(),
                            self.request(|reply| Msg::AwaitExit { pid, reply }),
                        )
                        .await;
                        if confirmed.is_err() {
                            log::warn!(
                                "Monitor pid {pid} did not confirm exit within {:?}, starting anyway",
                                timeouts.confirm_timeout()
                            );
                            force = true;
                        }
                    }
                }
            };

            match launcher::launch(&self.config, user_id, self.is_admin_host) {
                Ok(launched) => {
                    let pid = launched.pid;
                    self.send(Event::Spawned { attempt, pid })?;
                    self.attach(launched);
                    pid
                }
                Err(e) => {
                    let message = e.to_string();
                    self.send(Event::SpawnFailed {
                        attempt,
                        message: message.clone(),
                    })?;
                    let snapshot = self.request(|reply| Msg::Query { reply }).await?;
                    return Ok(CommandOutcome::failed(message, snapshot));
                }
            }
        };

        tokio::time::sleep(timeouts.grace_period()).await;
        let (snapshot, stopping) = self
            .request(|reply| Msg::GraceCheck { pid, reply })
            .await?;

        if stopping || snapshot.status == Status::Stopped {
            Ok(CommandOutcome::failed("Monitor stopped during startup", snapshot))
        } else if snapshot.running && snapshot.pid == Some(pid) {
            Ok(CommandOutcome::ok(
                format!("Monitor started (pid {pid})"),
                snapshot,
            ))
        } else {
            let message = snapshot
                .last_error
                .clone()
                .unwrap_or_else(|| "Monitor stopped during startup".to_string());
            Ok(CommandOutcome::failed(message, snapshot))
        }
    }

    /// Wire the pipes of a freshly spawned child into the event loop.
    fn attach(&self, launched: LaunchedProcess) {
        let LaunchedProcess { pid, mut child } = launched;
        let stdin = child.stdin.take();

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(
                stdout,
                pid,
                StreamKind::Stdout,
                Arc::clone(&self.classifier),
                self.tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(
                stderr,
                pid,
                StreamKind::Stderr,
                Arc::clone(&self.classifier),
                self.tx.clone(),
            )));
        }

        tokio::spawn(watch_exit(
            pid,
            child,
            stdin,
            pumps,
            self.config.timeouts.output_drain(),
            self.tx.clone(),
        ));
    }

    /// Ask the monitor to stop. Returns once termination has been handed
    /// off; the exit itself is confirmed asynchronously.
    pub async fn stop(&self) -> CommandOutcome {
        self.guarded(async { Ok(self.stop_inner().await?.0) })
            .await
    }

    /// Returns the outcome and the pid termination was requested for.
    async fn stop_inner(&self) -> Result<(CommandOutcome, Option<u32>)> {
        let _gate = self.gate.lock().await;
        let pid = self.request(|reply| Msg::Stop { reply }).await?;
        let snapshot = self.request(|reply| Msg::Query { reply }).await?;
        let outcome = match pid {
            Some(pid) => CommandOutcome::ok(format!("Stopping monitor (pid {pid})"), snapshot),
            None => CommandOutcome::ok("Monitor is not running", snapshot),
        };
        Ok((outcome, pid))
    }

    /// Current snapshot, after probing the tracked pid.
    pub async fn status(&self) -> StatusSnapshot {
        match self.request(|reply| Msg::Query { reply }).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Status query failed ({e}), returning last published status");
                self.current_status()
            }
        }
    }

    /// Last published snapshot, without a liveness probe.
    pub fn current_status(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }

    /// Resolves once `pid` is no longer tracked as live, or after `within`.
    /// Returns whether the exit was confirmed.
    pub async fn wait_for_exit(&self, pid: u32, within: Duration) -> bool {
        matches!(
            tokio::time::timeout(within, self.request(|reply| Msg::AwaitExit { pid, reply })).await,
            Ok(Ok(()))
        )
    }

    /// Stop the monitor and wait, bounded, for the OS to confirm its exit.
    pub async fn shutdown(&self) -> CommandOutcome {
        self.guarded(async {
            let (outcome, pid) = self.stop_inner().await?;
            if let Some(pid) = pid
                && !self
                    .wait_for_exit(pid, self.config.timeouts.confirm_timeout())
                    .await
            {
                log::warn!("Monitor pid {pid} did not confirm exit before shutdown");
            }
            Ok(CommandOutcome {
                status: self.status().await,
                ..outcome
            })
        })
        .await
    }

    pub fn subscribe_status<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        self.publisher.subscribe_status(callback)
    }

    pub fn subscribe_output<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&OutputLine) + Send + Sync + 'static,
    {
        self.publisher.subscribe_output(callback)
    }

    pub fn subscribe_exit<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ExitReport) + Send + Sync + 'static,
    {
        self.publisher.subscribe_exit(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }

    async fn fail_internal(&self, error: SupervisorError) -> CommandOutcome {
        let message = error.to_string();
        log::error!("Supervisor command failed: {message}");
        let _ = self.send(Event::InternalFailure {
            message: message.clone(),
        });
        CommandOutcome::failed(message, self.status().await)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("internal panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("internal panic: {s}")
    } else {
        "internal panic".to_string()
    }
}

/// Read one child stream to EOF, classifying each complete line.
async fn pump<R>(
    mut reader: R,
    pid: u32,
    stream: StreamKind,
    classifier: Arc<Classifier>,
    tx: mpsc::UnboundedSender<Msg>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    if !forward(&classifier, &tx, pid, stream, line) {
                        return;
                    }
                }
            }
            Err(e) => {
                log::warn!("[{pid}] {stream} read failed: {e}");
                break;
            }
        }
    }

    if let Some(line) = lines.finish() {
        forward(&classifier, &tx, pid, stream, line);
    }
}

fn forward(
    classifier: &Classifier,
    tx: &mpsc::UnboundedSender<Msg>,
    pid: u32,
    stream: StreamKind,
    line: String,
) -> bool {
    let class = classifier.classify(stream, &line);
    if matches!(
        class,
        Classification::Warning | Classification::Fatal | Classification::AdminRequired
    ) {
        log::warn!("[{pid}] {line}");
    } else {
        log::debug!("[{pid}] {line}");
    }
    tx.send(Msg::Event(Event::Output {
        pid,
        stream,
        line,
        class,
    }))
    .is_ok()
}

/// Wait for the child, let the pumps drain, then report the exit.
async fn watch_exit(
    pid: u32,
    mut child: Child,
    stdin: Option<ChildStdin>,
    pumps: Vec<JoinHandle<()>>,
    drain: Duration,
    tx: mpsc::UnboundedSender<Msg>,
) {
    let status = child.wait().await;
    drop(stdin);

    let (code, signal) = match status {
        Ok(status) => (status.code(), exit_signal(&status)),
        Err(e) => {
            log::error!("Failed to wait for monitor pid {pid}: {e}");
            (None, None)
        }
    };

    if tokio::time::timeout(drain, futures::future::join_all(pumps))
        .await
        .is_err()
    {
        log::debug!("[{pid}] output still open {drain:?} after exit, not waiting further");
    }

    let _ = tx.send(Msg::Event(Event::Exited { pid, code, signal }));
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
