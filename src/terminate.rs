//! Termination Controller: graceful request, bounded wait, forceful kill

use std::time::Duration;

use tokio::time::Instant;

use crate::config::Timeouts;
use crate::error::{Result, SupervisorError};
use crate::platform::{self, Delivery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing to stop.
    NotRunning,
    /// Exited after the graceful request.
    Graceful,
    /// Needed the forceful kill.
    Forced,
}

/// Poll `is_alive` until the pid disappears or `within` elapses.
pub async fn wait_for_exit(pid: u32, within: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if !platform::is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Stop `pid` and everything it spawned. Safe to call on a pid that is
/// already gone.
pub async fn stop(pid: u32, timeouts: &Timeouts) -> Result<StopOutcome> {
    if !platform::is_alive(pid) {
        log::debug!("Process {pid} already gone, nothing to stop");
        return Ok(StopOutcome::NotRunning);
    }

    log::info!("Requesting process {pid} to exit");
    match platform::request_exit(pid, timeouts.stop_grace()).await {
        Ok(Delivery::Gone) => return Ok(StopOutcome::NotRunning),
        Ok(Delivery::Delivered) => {
            if wait_for_exit(pid, timeouts.stop_grace(), timeouts.poll_interval()).await {
                log::info!("Process {pid} exited gracefully");
                return Ok(StopOutcome::Graceful);
            }
            log::warn!(
                "Process {pid} still alive after {:?}, forcing termination",
                timeouts.stop_grace()
            );
        }
        Err(e) => log::warn!("Graceful stop of {pid} failed ({e}), forcing termination"),
    }

    match platform::force_exit(pid, timeouts.kill_wait()).await? {
        Delivery::Gone => Ok(StopOutcome::Graceful),
        Delivery::Delivered => {
            if wait_for_exit(pid, timeouts.kill_wait(), timeouts.poll_interval()).await {
                log::info!("Process {pid} killed");
                Ok(StopOutcome::Forced)
            } else {
                log::error!("Process {pid} survived forceful termination");
                Err(SupervisorError::Unkillable { pid })
            }
        }
    }
}
