//! Supervisor configuration stored under `.cycler/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Supervisor configuration (TOML).
///
/// Edited by humans. Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CyclerConfig {
    /// Seconds without a worker message before a stall is suspected.
    pub stall_timeout_secs: u64,

    /// Context-usage percentage at which a worker must end its cycle
    /// instead of starting new work.
    pub token_threshold_percent: f64,

    /// Supervisor loop poll interval.
    pub poll_interval_ms: u64,

    /// Grace period between polite and forced worker termination.
    pub terminate_grace_secs: u64,

    /// Number of recent steps rendered into startup instructions.
    pub history_in_instructions: usize,

    pub worker: WorkerConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker command line. Supports `{instructions_file}`, `{channel}`,
    /// `{cycle}` and `{directory}` placeholders.
    pub command: Vec<String>,

    /// Working directory for workers. Relative paths resolve against the
    /// project root. Defaults to the project root.
    pub directory: Option<PathBuf>,

    /// Pipe the startup instructions to the worker's stdin, then close it.
    pub stdin_instructions: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--sandbox".to_string(),
                "danger-full-access".to_string(),
                "--skip-git-repo-check".to_string(),
                "-".to_string(),
            ],
            directory: None,
            stdin_instructions: true,
        }
    }
}

/// External service registry. Empty `command` disables registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    pub name: String,
    /// Invoked as `<command...> <register|heartbeat|deregister> <name>`.
    pub command: Vec<String>,
    pub heartbeat_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "cycler".to_string(),
            command: Vec::new(),
            heartbeat_interval_secs: 30,
            timeout_secs: 10,
        }
    }
}

impl Default for CyclerConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: 600,
            token_threshold_percent: 80.0,
            poll_interval_ms: 250,
            terminate_grace_secs: 10,
            history_in_instructions: 10,
            worker: WorkerConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl CyclerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stall_timeout_secs == 0 {
            return Err(anyhow!("stall_timeout_secs must be > 0"));
        }
        if !self.token_threshold_percent.is_finite()
            || self.token_threshold_percent < 1.0
            || self.token_threshold_percent > 100.0
        {
            return Err(anyhow!("token_threshold_percent must be within 1..=100"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if !self.registry.command.is_empty() {
            if self.registry.name.trim().is_empty() {
                return Err(anyhow!("registry.name must be set when registry.command is"));
            }
            if self.registry.heartbeat_interval_secs == 0 || self.registry.timeout_secs == 0 {
                return Err(anyhow!(
                    "registry heartbeat_interval_secs and timeout_secs must be > 0"
                ));
            }
        }
        Ok(())
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    /// Resolve the worker working directory against the project root.
    pub fn worker_directory(&self, root: &Path) -> PathBuf {
        match &self.worker.directory {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => root.to_path_buf(),
        }
    }
}

/// Command-line overrides layered on top of the file config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub stall_timeout_secs: Option<u64>,
    pub token_threshold_percent: Option<f64>,
    pub worker_directory: Option<PathBuf>,
}

impl ConfigOverrides {
    pub fn apply(&self, cfg: &mut CyclerConfig) -> Result<()> {
        if let Some(secs) = self.stall_timeout_secs {
            cfg.stall_timeout_secs = secs;
        }
        if let Some(percent) = self.token_threshold_percent {
            cfg.token_threshold_percent = percent;
        }
        if let Some(dir) = &self.worker_directory {
            cfg.worker.directory = Some(dir.clone());
        }
        cfg.validate()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CyclerConfig::default()`.
pub fn load_config(path: &Path) -> Result<CyclerConfig> {
    if !path.exists() {
        let cfg = CyclerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CyclerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CyclerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
