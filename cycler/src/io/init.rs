//! Canonical `.cycler/` layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{CyclerConfig, write_config};

/// All canonical paths within `.cycler/` for a project root.
#[derive(Debug, Clone)]
pub struct CyclerPaths {
    pub root: PathBuf,
    pub cycler_dir: PathBuf,
    pub state_dir: PathBuf,
    pub channels_dir: PathBuf,
    pub cycles_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub plan_path: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub stall_evidence_path: PathBuf,
    pub stall_decision_path: PathBuf,
    pub stop_request_path: PathBuf,
}

impl CyclerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let cycler_dir = root.join(".cycler");
        let state_dir = cycler_dir.join("state");
        Self {
            root: root.clone(),
            cycler_dir: cycler_dir.clone(),
            state_dir: state_dir.clone(),
            channels_dir: cycler_dir.join("channels"),
            cycles_dir: cycler_dir.join("cycles"),
            gitignore_path: cycler_dir.join(".gitignore"),
            plan_path: cycler_dir.join("PLAN.md"),
            config_path: cycler_dir.join("config.toml"),
            state_path: state_dir.join("orchestration_state.json"),
            stall_evidence_path: state_dir.join("stall_evidence.json"),
            stall_decision_path: state_dir.join("stall_decision.json"),
            stop_request_path: state_dir.join("stop.request"),
        }
    }

    /// Channel endpoint for one cycle. Unique per (plan, cycle) so a late
    /// sender from an earlier cycle can never reach a newer listener.
    pub fn channel_path(&self, plan_id: &str, cycle: u32) -> PathBuf {
        self.channels_dir.join(format!("{plan_id}-c{cycle}.sock"))
    }

    pub fn cycle_dir(&self, plan_id: &str, cycle: u32) -> PathBuf {
        self.cycles_dir.join(plan_id).join(cycle.to_string())
    }
}

/// Options for `init_cycler`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing cycler-owned files.
    pub force: bool,
}

/// Create `.cycler/` scaffolding in `root`.
///
/// Fails if `.cycler/` already exists unless `options.force` is set. Never
/// touches the persisted orchestration state.
pub fn init_cycler(root: &Path, options: &InitOptions) -> Result<CyclerPaths> {
    let paths = CyclerPaths::new(root);
    if paths.cycler_dir.exists() && !paths.cycler_dir.is_dir() {
        return Err(anyhow!("cycler init: .cycler exists but is not a directory"));
    }
    if paths.cycler_dir.exists() && !options.force {
        return Err(anyhow!(
            "cycler init: .cycler already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.cycler_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.channels_dir)?;
    create_dir(&paths.cycles_dir)?;

    write_file(&paths.gitignore_path, CYCLER_GITIGNORE)?;
    write_file(&paths.plan_path, PLAN_PLACEHOLDER)?;
    write_config(&paths.config_path, &CyclerConfig::default())?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const PLAN_PLACEHOLDER: &str =
    "# Plan\n\nDescribe the overall plan and its steps here. Workers read this file.\n";
const CYCLER_GITIGNORE: &str = "channels/\ncycles/\nstate/*.tmp\nstate/stop.request\n";
