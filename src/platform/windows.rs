//! Windows primitives: role query via PowerShell, `OpenProcess` probes, `taskkill /T`

use std::os::windows::process::CommandExt as _;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use ::windows::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
use ::windows::Win32::System::Threading::{
    CREATE_NO_WINDOW, GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
};

use super::Delivery;
use crate::error::{Result, SupervisorError};

const ROLE_QUERY: &str = "([Security.Principal.WindowsPrincipal][Security.Principal.WindowsIdentity]::GetCurrent()).IsInRole([Security.Principal.WindowsBuiltInRole]::Administrator)";

/// Asks PowerShell whether the current identity holds the Administrator role.
/// Anything other than an exact `True` is "not elevated".
pub fn query_elevation() -> anyhow::Result<bool> {
    let output = std::process::Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", ROLE_QUERY])
        .stdin(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW.0)
        .output()
        .context("Failed to execute powershell role query")?;

    if !output.status.success() {
        anyhow::bail!(
            "Role query failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim() == "True")
}

pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) else {
            return false;
        };
        let mut code: u32 = 0;
        let queried = GetExitCodeProcess(handle, &mut code).is_ok();
        let _ = CloseHandle(handle);
        queried && code == STILL_ACTIVE.0 as u32
    }
}

async fn taskkill(pid: u32, force: bool, timeout: Duration) -> Result<Delivery> {
    if !is_alive(pid) {
        return Ok(Delivery::Gone);
    }

    let pid_string = pid.to_string();
    let mut cmd = tokio::process::Command::new("taskkill");
    cmd.args(["/PID", &pid_string, "/T"]);
    if force {
        cmd.arg("/F");
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW.0);

    let status = tokio::time::timeout(timeout.max(Duration::from_secs(2)), cmd.status())
        .await
        .map_err(|_| SupervisorError::Signal {
            pid,
            message: "taskkill timed out".into(),
        })?
        .map_err(|e| SupervisorError::Signal {
            pid,
            message: format!("failed to run taskkill: {e}"),
        })?;

    if status.success() {
        Ok(Delivery::Delivered)
    } else if !is_alive(pid) {
        Ok(Delivery::Gone)
    } else {
        Err(SupervisorError::Signal {
            pid,
            message: format!("taskkill exited with {status}"),
        })
    }
}

pub async fn request_exit(pid: u32, timeout: Duration) -> Result<Delivery> {
    taskkill(pid, false, timeout).await
}

pub async fn force_exit(pid: u32, timeout: Duration) -> Result<Delivery> {
    taskkill(pid, true, timeout).await
}

pub fn prepare_command(cmd: &mut tokio::process::Command) {
    cmd.creation_flags(CREATE_NO_WINDOW.0);
}
