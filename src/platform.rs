//! OS primitives used by the supervisor - selected per platform
//!
//! Provides a unified interface over:
//! - POSIX (Linux, macOS): effective uid, `kill(pid, 0)`, process-group signals
//! - Windows: PowerShell role query, `OpenProcess`, `taskkill /T`

use std::time::Duration;

use crate::error::Result;

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use self::unix as imp;
    } else if #[cfg(windows)] {
        mod windows;
        use self::windows as imp;
    }
}

/// Result of delivering a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Nothing to signal: the process is already gone.
    Gone,
}

/// Raw elevation query. Errors are the caller's to fail closed on.
pub fn query_elevation() -> anyhow::Result<bool> {
    imp::query_elevation()
}

/// Non-destructive existence check.
pub fn is_alive(pid: u32) -> bool {
    imp::is_alive(pid)
}

/// Ask the process, and whatever it spawned, to exit.
pub async fn request_exit(pid: u32, timeout: Duration) -> Result<Delivery> {
    imp::request_exit(pid, timeout).await
}

/// Kill the process tree outright.
pub async fn force_exit(pid: u32, timeout: Duration) -> Result<Delivery> {
    imp::force_exit(pid, timeout).await
}

/// Spawn-time adjustments: own process group on POSIX so the whole tree can
/// be signalled, no console window on Windows.
pub fn prepare_command(cmd: &mut tokio::process::Command) {
    imp::prepare_command(cmd);
}
