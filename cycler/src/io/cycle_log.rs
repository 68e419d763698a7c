//! Per-cycle artifacts under `.cycler/cycles/<plan>/<cycle>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{CycleStatus, LastMessage, OrchestrationState};
use crate::io::init::CyclerPaths;

/// Summary written when a cycle ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleMeta {
    pub plan_id: String,
    pub cycle: u32,
    pub status: CycleStatus,
    pub worker_pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    /// Step numbers recorded during this cycle.
    pub steps: Vec<u32>,
    pub last_message: Option<LastMessage>,
}

impl CycleMeta {
    /// Build the meta record for `cycle` from the persisted state.
    pub fn from_state(
        state: &OrchestrationState,
        plan_id: &str,
        cycle: u32,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let entry = state.cycles.iter().rev().find(|record| record.cycle == cycle);
        let started_at = entry.map(|record| record.started_at);
        let duration_ms = started_at
            .and_then(|start| (ended_at - start).to_std().ok())
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        Self {
            plan_id: plan_id.to_string(),
            cycle,
            status: entry
                .map(|record| record.status)
                .or(state.cycle_status)
                .unwrap_or(CycleStatus::Running),
            worker_pid: entry.and_then(|record| record.worker_pid),
            started_at,
            ended_at,
            duration_ms,
            steps: state.steps_in_cycle(cycle).map(|record| record.step).collect(),
            last_message: state.last_message.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CyclePaths {
    pub dir: PathBuf,
    pub instructions_path: PathBuf,
    pub log_path: PathBuf,
    pub meta_path: PathBuf,
}

impl CyclePaths {
    pub fn new(paths: &CyclerPaths, plan_id: &str, cycle: u32) -> Self {
        let dir = paths.cycle_dir(plan_id, cycle);
        Self {
            dir: dir.clone(),
            instructions_path: dir.join("instructions.md"),
            log_path: dir.join("worker.log"),
            meta_path: dir.join("meta.json"),
        }
    }
}

pub fn write_instructions(paths: &CyclePaths, instructions: &str) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create cycle dir {}", paths.dir.display()))?;
    write_text(&paths.instructions_path, instructions)
}

pub fn write_cycle_meta(paths: &CyclePaths, meta: &CycleMeta) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create cycle dir {}", paths.dir.display()))?;
    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    write_text(&paths.meta_path, &buf)
}

pub fn read_cycle_meta(paths: &CyclePaths) -> Result<Option<CycleMeta>> {
    if !paths.meta_path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&paths.meta_path)
        .with_context(|| format!("read {}", paths.meta_path.display()))?;
    let meta = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", paths.meta_path.display()))?;
    Ok(Some(meta))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
