#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sentinel_supervisor::config::Timeouts;
use sentinel_supervisor::platform;
use sentinel_supervisor::{StatusSnapshot, Status, Supervisor, SupervisorConfig};

const READY_THEN_SLEEP: &str = "sleep 0.1\necho SENTINEL_READY\nexec sleep 30\n";

fn config_for(dir: &Path, script: &str) -> SupervisorConfig {
    let entrypoint = dir.join("monitor.sh");
    fs::write(&entrypoint, script).unwrap();
    SupervisorConfig {
        project_root: Some(dir.to_path_buf()),
        entrypoint: entrypoint.to_string_lossy().into_owned(),
        interpreter: Some("/bin/sh".into()),
        require_admin: Some(false),
        timeouts: Timeouts {
            grace_period_ms: 400,
            stop_grace_ms: 1000,
            kill_wait_ms: 2000,
            poll_interval_ms: 20,
            output_drain_ms: 300,
            confirm_timeout_ms: 4000,
        },
        ..SupervisorConfig::default()
    }
}

async fn eventually(
    sup: &Supervisor,
    within: Duration,
    pred: impl Fn(&StatusSnapshot) -> bool,
) -> StatusSnapshot {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let snap = sup.status().await;
        if pred(&snap) || tokio::time::Instant::now() >= deadline {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn record_statuses(sup: &Supervisor) -> Arc<Mutex<Vec<Status>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    sup.subscribe_status(move |s| {
        let mut seen = sink.lock().unwrap();
        if seen.last() != Some(&s.status) {
            seen.push(s.status);
        }
    });
    seen
}

#[tokio::test(flavor = "multi_thread")]
async fn ready_marker_walks_to_running() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::with_elevation(config_for(dir.path(), READY_THEN_SLEEP), false);
    let seen = record_statuses(&sup);

    let outcome = sup.start("u1").await;
    assert!(outcome.success, "{}", outcome.message);

    let snap = sup.status().await;
    assert!(snap.running);
    assert_eq!(snap.status, Status::Running);
    assert_eq!(snap.user_id.as_deref(), Some("u1"));
    let pid = snap.pid.unwrap();
    assert!(platform::is_alive(pid));
    assert_eq!(
        seen.lock().unwrap()[..3],
        [Status::Starting, Status::Initializing, Status::Running]
    );

    let outcome = sup.shutdown().await;
    assert_eq!(outcome.status.status, Status::Stopped);
    assert!(!platform::is_alive(pid));
}

#[tokio::test(flavor = "multi_thread")]
async fn immediate_exit_is_a_failed_start() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::with_elevation(
        config_for(dir.path(), "echo 'ModuleNotFoundError: psutil' >&2\nexit 1\n"),
        false,
    );
    let seen = record_statuses(&sup);

    let outcome = sup.start("u2").await;
    assert!(!outcome.success);
    assert_eq!(outcome.status.status, Status::Error);
    let last_error = outcome.status.last_error.clone().unwrap();
    assert!(!last_error.is_empty());
    assert!(last_error.contains("psutil"), "{last_error}");
    assert_eq!(outcome.message, last_error);
    assert!(!seen.lock().unwrap().contains(&Status::Running));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_during_startup_ends_stopped_and_unsubscribe_holds() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::with_elevation(config_for(dir.path(), READY_THEN_SLEEP), false);

    let calls = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&calls);
    let id = sup.subscribe_status(move |_| *sink.lock().unwrap() += 1);

    let starter = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.start("u3").await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(sup.stop().await.success);

    let snap = eventually(&sup, Duration::from_secs(5), |s| s.status == Status::Stopped).await;
    assert_eq!(snap.status, Status::Stopped);
    assert_eq!(snap.pid, None);
    assert!(!snap.running);

    let started = starter.await.unwrap();
    assert!(!started.success);
    assert_eq!(started.message, "Monitor stopped during startup");

    assert!(sup.unsubscribe(id));
    assert!(!sup.unsubscribe(id));
    let before = *calls.lock().unwrap();
    assert!(before > 0);

    sup.start("u3").await;
    sup.shutdown().await;
    assert_eq!(*calls.lock().unwrap(), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn switching_users_never_leaves_two_children() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::with_elevation(config_for(dir.path(), READY_THEN_SLEEP), false);

    let first = sup.start("userA").await;
    assert!(first.success, "{}", first.message);
    let pid_a = first.status.pid.unwrap();

    let second = sup.start("userB").await;
    assert!(second.success, "{}", second.message);
    let pid_b = second.status.pid.unwrap();

    assert_ne!(pid_a, pid_b);
    assert!(!platform::is_alive(pid_a));
    assert!(platform::is_alive(pid_b));
    assert_eq!(sup.status().await.user_id.as_deref(), Some("userB"));
    assert_ne!(first.status.session_id, second.status.session_id);

    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_twice_after_running() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::with_elevation(config_for(dir.path(), READY_THEN_SLEEP), false);
    assert!(sup.start("u1").await.success);

    assert!(sup.stop().await.success);
    let second = sup.stop().await;
    assert!(second.success);

    let snap = eventually(&sup, Duration::from_secs(5), |s| !s.running).await;
    assert_eq!(snap.status, Status::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn external_kill_is_reconciled() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::with_elevation(config_for(dir.path(), READY_THEN_SLEEP), false);
    let outcome = sup.start("u1").await;
    let pid = outcome.status.pid.unwrap();

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let snap = eventually(&sup, Duration::from_secs(5), |s| !s.running).await;
    assert!(!snap.running);
    assert_eq!(snap.status, Status::Crashed);
    assert!(snap.last_error.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_pid_is_reconciled_before_the_exit_event() {
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;

    // The background sleep keeps the pipes open, so the exit watcher is
    // still draining output when the status query runs.
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_for(
        dir.path(),
        "sleep 30 &\nsleep 0.1\necho SENTINEL_READY\nexec sleep 30\n",
    );
    cfg.timeouts.output_drain_ms = 20_000;
    let sup = Supervisor::with_elevation(cfg, false);

    let outcome = sup.start("u1").await;
    assert!(outcome.success, "{}", outcome.message);
    let pid = outcome.status.pid.unwrap();

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    let snap = eventually(&sup, Duration::from_secs(5), |s| !s.running).await;
    assert!(!snap.running);
    assert_eq!(snap.status, Status::Crashed);
    assert_eq!(snap.pid, None);
    let last_error = snap.last_error.unwrap();
    assert!(last_error.contains("no longer running"), "{last_error}");

    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[tokio::test(flavor = "multi_thread")]
async fn admin_marker_surfaces_requires_admin() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::with_elevation(
        config_for(
            dir.path(),
            "echo 'Please run as administrator to enable all monitoring features.'\nexec sleep 30\n",
        ),
        false,
    );

    let outcome = sup.start("u1").await;
    assert!(!outcome.success);
    assert_eq!(outcome.status.status, Status::RequiresAdmin);
    assert!(outcome.status.requires_admin);
    assert!(!outcome.status.admin);

    // The monitor is still alive and still gets torn down.
    let outcome = sup.shutdown().await;
    assert_eq!(outcome.status.status, Status::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn output_lines_are_forwarded_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::with_elevation(
        config_for(
            dir.path(),
            "echo \"args: $*\"\necho 'warming up' >&2\necho SENTINEL_READY\nexec sleep 30\n",
        ),
        false,
    );
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    sup.subscribe_output(move |l| sink.lock().unwrap().push(l.line.clone()));

    assert!(sup.start("u7").await.success);
    let lines = lines.lock().unwrap().clone();
    assert!(lines.contains(&"args: --user-id u7 --no-admin".to_string()), "{lines:?}");
    assert!(lines.contains(&"warming up".to_string()));
    assert!(lines.contains(&"SENTINEL_READY".to_string()));
    assert_eq!(sup.status().await.last_error.as_deref(), Some("warming up"));

    sup.shutdown().await;
}
