//! POSIX primitives: effective uid, signal-0 probes, process-group signals

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::Delivery;
use crate::error::{Result, SupervisorError};

/// Elevated iff the effective uid is 0.
pub fn query_elevation() -> anyhow::Result<bool> {
    Ok(nix::unistd::geteuid().is_root())
}

/// Pids 0 and 1 (and anything that does not fit `pid_t`) are never ours;
/// signalling 0 would hit our own process group.
fn to_pid(pid: u32) -> Option<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 1 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

pub fn is_alive(pid: u32) -> bool {
    let Some(nix_pid) = to_pid(pid) else {
        return false;
    };
    match signal::kill(nix_pid, None) {
        Ok(()) => !is_zombie(pid),
        // Exists, owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// An exited-but-unreaped child still answers signal 0.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Field 3, after the parenthesised command name (which may contain spaces).
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Signal the process group led by `pid`, falling back to the single process
/// when it does not lead a group.
fn signal_tree(pid: u32, sig: Signal) -> Result<Delivery> {
    let Some(nix_pid) = to_pid(pid) else {
        return Ok(Delivery::Gone);
    };

    match signal::killpg(nix_pid, sig) {
        Ok(()) => return Ok(Delivery::Delivered),
        Err(Errno::ESRCH) => {}
        Err(e) => log::debug!("killpg({pid}, {sig}) failed: {e}, trying the process alone"),
    }

    match signal::kill(nix_pid, sig) {
        Ok(()) => Ok(Delivery::Delivered),
        Err(Errno::ESRCH) => Ok(Delivery::Gone),
        Err(e) => Err(SupervisorError::Signal {
            pid,
            message: format!("{sig}: {e}"),
        }),
    }
}

pub async fn request_exit(pid: u32, _timeout: Duration) -> Result<Delivery> {
    signal_tree(pid, Signal::SIGTERM)
}

pub async fn force_exit(pid: u32, _timeout: Duration) -> Result<Delivery> {
    signal_tree(pid, Signal::SIGKILL)
}

pub fn prepare_command(cmd: &mut tokio::process::Command) {
    // New group with the child as leader; it stays our child, not a daemon.
    cmd.process_group(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn reserved_pids_are_never_alive_or_signalled() {
        assert!(!is_alive(0));
        assert!(!is_alive(1));
        assert_eq!(signal_tree(0, Signal::SIGTERM).unwrap(), Delivery::Gone);
    }

    #[test]
    fn reaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unreaped_child_counts_as_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Give it time to exit without reaping it.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !is_zombie(pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!is_alive(pid));
        child.wait().unwrap();
    }

    #[test]
    fn terminating_a_gone_process_reports_gone() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert_eq!(signal_tree(pid, Signal::SIGTERM).unwrap(), Delivery::Gone);
    }
}
