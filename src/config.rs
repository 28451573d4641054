use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top‑level supervisor configuration, persisted as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Base directory for relative interpreter and entry point paths.
    /// Falls back to the current working directory.
    pub project_root: Option<PathBuf>,
    /// Monitor entry point, relative to `project_root` unless absolute.
    pub entrypoint: String,
    /// Explicit interpreter; bypasses the local → system fallback chain.
    pub interpreter: Option<String>,
    /// Isolated-environment interpreters, probed in order.
    pub local_interpreters: Vec<String>,
    /// System interpreters resolved by name on `PATH`.
    pub system_interpreters: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub build_mode: BuildMode,
    /// Overrides the platform/build-mode admin policy when set.
    pub require_admin: Option<bool>,
    pub timeouts: Timeouts,
    pub markers: MarkerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    Development,
    Production,
}

impl Default for BuildMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            BuildMode::Development
        } else {
            BuildMode::Production
        }
    }
}

/// All timing knobs in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Window after spawn in which an exit counts as a failed start.
    pub grace_period_ms: u64,
    /// Wait after the graceful request before escalating to a forceful kill.
    pub stop_grace_ms: u64,
    /// Wait after the forceful kill before giving up.
    pub kill_wait_ms: u64,
    pub poll_interval_ms: u64,
    /// How long the exit watcher waits for the output pumps to hit EOF.
    pub output_drain_ms: u64,
    /// Bounded wait for exit confirmation when replacing a session.
    pub confirm_timeout_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            grace_period_ms: 1500,
            stop_grace_ms: 3000,
            kill_wait_ms: 2000,
            poll_interval_ms: 100,
            output_drain_ms: 500,
            confirm_timeout_ms: 6000,
        }
    }
}

impl Timeouts {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

/// Marker substrings recognised in the monitor's output. Matching is
/// case-sensitive; the strings must stay compatible with the monitor child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub ready: Vec<String>,
    pub integrated: Vec<String>,
    pub admin_required: Vec<String>,
    pub fatal: Vec<String>,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            ready: vec!["SENTINEL_READY".into()],
            integrated: vec![
                "SENTINEL_INTEGRATED".into(),
                "Running in integrated mode".into(),
            ],
            admin_required: vec![
                "requires administrator privileges".into(),
                "run as administrator".into(),
            ],
            fatal: vec![
                "FATAL".into(),
                "CRITICAL".into(),
                "Traceback (most recent call last)".into(),
            ],
        }
    }
}

fn default_local_interpreters() -> Vec<String> {
    #[cfg(windows)]
    {
        vec![
            r".venv\Scripts\python.exe".into(),
            r"venv\Scripts\python.exe".into(),
        ]
    }

    #[cfg(not(windows))]
    {
        vec![
            ".venv/bin/python3".into(),
            ".venv/bin/python".into(),
            "venv/bin/python3".into(),
            "venv/bin/python".into(),
        ]
    }
}

fn default_system_interpreters() -> Vec<String> {
    #[cfg(windows)]
    {
        vec!["python".into(), "py".into()]
    }

    #[cfg(not(windows))]
    {
        vec!["python3".into(), "python".into()]
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            project_root: None,
            entrypoint: "src/python/sentinel.py".into(),
            interpreter: None,
            local_interpreters: default_local_interpreters(),
            system_interpreters: default_system_interpreters(),
            working_dir: None,
            env: HashMap::new(),
            build_mode: BuildMode::default(),
            require_admin: None,
            timeouts: Timeouts::default(),
            markers: MarkerConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Directory relative paths are resolved against.
    pub fn root(&self) -> PathBuf {
        self.project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Default on-disk location: `<config dir>/sentinel/supervisor.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("sentinel");
        Ok(config_dir.join("supervisor.toml"))
    }

    /// Read the config at `path`, writing the defaults there first if the
    /// file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "Config not found at {}, creating default configuration",
                path.display()
            );

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create config directory")?;
            }

            let default_toml = toml::to_string_pretty(&SupervisorConfig::default())
                .context("Failed to serialize default config")?;
            fs::write(path, default_toml).context("Failed to write config file")?;

            log::info!("Created default configuration at {}", path.display());
        }

        let cfg_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: SupervisorConfig = toml::from_str(&cfg_str)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        log::info!("Using config from: {}", path.display());
        Ok(cfg)
    }
}
