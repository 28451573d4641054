//! Process Launcher: interpreter resolution and child spawn

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::platform;

/// A spawned monitor with its pipes still attached to `child`.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: u32,
    pub child: Child,
}

/// Resolved program and arguments, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

fn under_root(root: &Path, candidate: &str) -> PathBuf {
    let path = Path::new(candidate);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Local (isolated environment) interpreter first, then a system one found
/// on `PATH`. An explicit `interpreter` skips the chain but must still exist.
pub fn resolve_interpreter(cfg: &SupervisorConfig) -> Result<PathBuf> {
    let root = cfg.root();

    if let Some(explicit) = cfg.interpreter.as_deref() {
        let candidate = under_root(&root, explicit);
        if candidate.is_file() {
            return Ok(candidate);
        }
        return which::which(explicit).map_err(|_| SupervisorError::InterpreterNotFound {
            searched: format!("{}, {explicit} on PATH", candidate.display()),
        });
    }

    for local in &cfg.local_interpreters {
        let candidate = under_root(&root, local);
        if candidate.is_file() {
            log::debug!("Using local interpreter {}", candidate.display());
            return Ok(candidate);
        }
    }

    for name in &cfg.system_interpreters {
        match which::which(name) {
            Ok(path) => {
                log::debug!("Using system interpreter {}", path.display());
                return Ok(path);
            }
            Err(e) => log::trace!("{name} not on PATH: {e}"),
        }
    }

    let searched = cfg
        .local_interpreters
        .iter()
        .chain(&cfg.system_interpreters)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    Err(SupervisorError::InterpreterNotFound { searched })
}

pub fn resolve_entrypoint(cfg: &SupervisorConfig) -> Result<PathBuf> {
    let path = under_root(&cfg.root(), &cfg.entrypoint);
    if path.is_file() {
        Ok(path)
    } else {
        Err(SupervisorError::EntrypointNotFound(path))
    }
}

/// `<entrypoint> --user-id <id> --admin|--no-admin`. The flag is the
/// supervisor's real elevation, never the policy.
pub fn build_args(entrypoint: &Path, user_id: &str, elevated: bool) -> Vec<String> {
    vec![
        entrypoint.to_string_lossy().into_owned(),
        "--user-id".to_string(),
        user_id.to_string(),
        if elevated { "--admin" } else { "--no-admin" }.to_string(),
    ]
}

pub fn prepare(cfg: &SupervisorConfig, user_id: &str, elevated: bool) -> Result<Invocation> {
    let program = resolve_interpreter(cfg)?;
    let entrypoint = resolve_entrypoint(cfg)?;
    Ok(Invocation {
        program,
        args: build_args(&entrypoint, user_id, elevated),
    })
}

/// Resolve and spawn the monitor for `user_id` with all three streams piped.
/// The child stays attached: it is not killed on drop and must be stopped
/// explicitly.
///
/// Python block-buffers a piped stdout, which would hold the ready marker
/// back until exit, so the child runs unbuffered unless `cfg.env` says
/// otherwise.
pub fn launch(cfg: &SupervisorConfig, user_id: &str, elevated: bool) -> Result<LaunchedProcess> {
    let invocation = prepare(cfg, user_id, elevated)?;

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .env("PYTHONUNBUFFERED", "1")
        .envs(&cfg.env)
        .current_dir(cfg.working_dir.clone().unwrap_or_else(|| cfg.root()))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    platform::prepare_command(&mut cmd);

    log::info!(
        "Launching monitor: {} {}",
        invocation.program.display(),
        invocation.args.join(" ")
    );

    let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        program: invocation.program.display().to_string(),
        source,
    })?;
    let pid = child.id().ok_or(SupervisorError::MissingPid)?;

    log::info!("Monitor spawned (PID: {pid}) for user {user_id}");
    Ok(LaunchedProcess { pid, child })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn cfg_in(root: &Path) -> SupervisorConfig {
        SupervisorConfig {
            project_root: Some(root.to_path_buf()),
            entrypoint: "monitor.py".into(),
            local_interpreters: vec!["venv/bin/python".into()],
            system_interpreters: vec!["definitely-not-an-interpreter-xyz".into()],
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn local_interpreter_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("venv/bin/python");
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        fs::write(&local, "").unwrap();

        let mut cfg = cfg_in(dir.path());
        cfg.system_interpreters = vec!["sh".into()];
        assert_eq!(resolve_interpreter(&cfg).unwrap(), local);
    }

    #[cfg(unix)]
    #[test]
    fn falls_back_to_a_system_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = cfg_in(dir.path());
        cfg.system_interpreters = vec!["definitely-not-an-interpreter-xyz".into(), "sh".into()];
        let found = resolve_interpreter(&cfg).unwrap();
        assert!(found.ends_with("sh"), "{}", found.display());
    }

    #[test]
    fn nothing_resolvable_is_interpreter_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_interpreter(&cfg_in(dir.path())).unwrap_err();
        match err {
            SupervisorError::InterpreterNotFound { searched } => {
                assert!(searched.contains("venv/bin/python"));
                assert!(searched.contains("definitely-not-an-interpreter-xyz"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn explicit_interpreter_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = cfg_in(dir.path());
        cfg.interpreter = Some("missing/python".into());
        match resolve_interpreter(&cfg) {
            Err(SupervisorError::InterpreterNotFound { searched }) => {
                let joined = dir.path().join("missing/python");
                assert!(searched.contains(&*joined.to_string_lossy()), "{searched}");
                assert!(searched.contains("missing/python on PATH"), "{searched}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_entrypoint_is_reported_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        match resolve_entrypoint(&cfg_in(dir.path())) {
            Err(SupervisorError::EntrypointNotFound(path)) => {
                assert_eq!(path, dir.path().join("monitor.py"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn args_carry_user_and_real_elevation() {
        let ep = Path::new("/opt/sentinel.py");
        assert_eq!(
            build_args(ep, "u1", false),
            vec!["/opt/sentinel.py", "--user-id", "u1", "--no-admin"]
        );
        assert_eq!(build_args(ep, "u1", true)[3], "--admin");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_pipes_all_streams() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("monitor.py"), "echo \"$@\"\n").unwrap();
        let mut cfg = cfg_in(dir.path());
        cfg.interpreter = Some("/bin/sh".into());

        let mut launched = launch(&cfg, "u9", false).unwrap();
        assert!(launched.pid > 0);
        assert!(launched.child.stdin.is_some());
        assert!(launched.child.stderr.is_some());

        let mut stdout = launched.child.stdout.take().unwrap();
        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stdout, &mut out)
            .await
            .unwrap();
        assert_eq!(out.trim(), "--user-id u9 --no-admin");
        assert!(launched.child.wait().await.unwrap().success());
    }

    #[cfg(unix)]
    async fn launched_stdout(cfg: &SupervisorConfig) -> String {
        let mut launched = launch(cfg, "u9", false).unwrap();
        let mut stdout = launched.child.stdout.take().unwrap();
        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stdout, &mut out)
            .await
            .unwrap();
        launched.child.wait().await.unwrap();
        out
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_runs_unbuffered_unless_overridden() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("monitor.py"),
            "echo \"unbuffered=${PYTHONUNBUFFERED:-unset}\"\n",
        )
        .unwrap();
        let mut cfg = cfg_in(dir.path());
        cfg.interpreter = Some("/bin/sh".into());
        assert_eq!(launched_stdout(&cfg).await.trim(), "unbuffered=1");

        cfg.env.insert("PYTHONUNBUFFERED".into(), "0".into());
        assert_eq!(launched_stdout(&cfg).await.trim(), "unbuffered=0");
    }
}
