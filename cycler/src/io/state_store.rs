//! Durable orchestration state (`.cycler/state/orchestration_state.json`).
//!
//! Every mutator applies exactly one change and performs exactly one atomic
//! save. A crash can lose at most the mutation in flight; the file on disk
//! always holds a fully applied revision.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, error, instrument};

use crate::core::invariants::validate_invariants;
use crate::core::types::{
    CycleRecord, CycleStatus, EndReason, LastMessage, MessageKind, OrchestrationState, StepRecord,
    WorkerRecord,
};
use crate::errors::StateCorrupt;

const STATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/orchestration_state/v1.schema.json"
));

static SCHEMA: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let value: Value = serde_json::from_str(STATE_SCHEMA).map_err(|err| err.to_string())?;
    validator_for(&value).map_err(|err| err.to_string())
});

/// File-backed store for [`OrchestrationState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the persisted state.
    ///
    /// `Ok(None)` means no state has been written yet.
    pub fn load_checked(&self) -> Result<Option<OrchestrationState>, StateCorrupt> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.corrupt(format!("read failed: {err}"))),
        };
        let value: Value = serde_json::from_str(&contents)
            .map_err(|err| self.corrupt(format!("invalid json: {err}")))?;
        validate_schema(&value).map_err(|reason| self.corrupt(reason))?;
        let state: OrchestrationState = serde_json::from_value(value)
            .map_err(|err| self.corrupt(format!("deserialize: {err}")))?;
        let errors = validate_invariants(&state);
        if !errors.is_empty() {
            return Err(self.corrupt(format!("invariants failed: {}", errors.join("; "))));
        }
        Ok(Some(state))
    }

    /// Load the persisted state, falling back to an empty default.
    ///
    /// A missing file and a corrupt file both yield a clean state. Corruption
    /// is logged at `error!` and the offending file is moved aside as
    /// `<name>.corrupt-<timestamp>` so it can be inspected later.
    pub fn load(&self) -> OrchestrationState {
        match self.load_checked() {
            Ok(Some(state)) => {
                debug!(
                    revision = state.revision,
                    cycle = state.cycle_number,
                    step = state.current_step,
                    "orchestration state loaded"
                );
                state
            }
            Ok(None) => OrchestrationState::default(),
            Err(corrupt) => {
                error!(
                    path = %corrupt.path.display(),
                    reason = %corrupt.reason,
                    "orchestration state is corrupt; starting from an empty state"
                );
                match self.quarantine(Utc::now()) {
                    Ok(backup) => {
                        error!(backup = %backup.display(), "corrupt state preserved");
                    }
                    Err(err) => error!("failed to preserve corrupt state: {err:#}"),
                }
                OrchestrationState::default()
            }
        }
    }

    /// Atomically persist `state` (temp file + fsync + rename).
    ///
    /// Bumps `revision` and stamps `last_updated`. On failure `state` is left
    /// exactly as it was, matching what is still on disk.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn save(&self, state: &mut OrchestrationState) -> Result<()> {
        let next = state.clone();
        self.commit(state, next)
    }

    fn commit(&self, state: &mut OrchestrationState, mut next: OrchestrationState) -> Result<()> {
        next.revision = state.revision + 1;
        next.last_updated = Some(Utc::now());
        let mut buf = serde_json::to_string_pretty(&next).context("serialize state")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)?;
        debug!(revision = next.revision, "orchestration state saved");
        *state = next;
        Ok(())
    }

    /// Mark `cycle` as running under `worker`.
    ///
    /// Re-recording the same cycle (replacement worker after a crash) updates
    /// the existing cycle log entry instead of appending a second one.
    pub fn record_cycle_start(
        &self,
        state: &mut OrchestrationState,
        cycle: u32,
        worker: WorkerRecord,
    ) -> Result<()> {
        if cycle < state.cycle_number {
            return Err(anyhow!(
                "refusing to start cycle {cycle}: state is already at cycle {}",
                state.cycle_number
            ));
        }
        let entry = CycleRecord {
            cycle,
            status: CycleStatus::Running,
            started_at: worker.started_at,
            ended_at: None,
            worker_pid: Some(worker.pid),
        };
        let mut next = state.clone();
        match next.cycles.last_mut() {
            Some(last) if last.cycle == cycle => *last = entry,
            _ => next.cycles.push(entry),
        }
        next.cycle_number = cycle;
        next.cycle_status = Some(CycleStatus::Running);
        next.worker = Some(worker);
        self.commit(state, next)
    }

    /// Append a completed step to the plan history.
    pub fn record_step(
        &self,
        state: &mut OrchestrationState,
        step: StepRecord,
        summary: String,
    ) -> Result<()> {
        if step.step <= state.current_step {
            return Err(anyhow!(
                "step {} is not after current step {}",
                step.step,
                state.current_step
            ));
        }
        let mut next = state.clone();
        next.current_step = step.step;
        if step.tokens_used_percent.is_some() {
            next.tokens_used_percent = step.tokens_used_percent;
        }
        next.last_message = Some(LastMessage {
            kind: MessageKind::StepComplete,
            summary,
            received_at: step.completed_at,
        });
        next.history.push(step);
        self.commit(state, next)
    }

    /// Fold a message that does not extend the history into `last_message`.
    pub fn record_message(
        &self,
        state: &mut OrchestrationState,
        message: LastMessage,
        tokens_used_percent: Option<f64>,
    ) -> Result<()> {
        let mut next = state.clone();
        if tokens_used_percent.is_some() {
            next.tokens_used_percent = tokens_used_percent;
        }
        next.last_message = Some(message);
        self.commit(state, next)
    }

    /// Close `cycle` with the status implied by `reason`, folding in the
    /// message that ended it, if any.
    pub fn record_cycle_end(
        &self,
        state: &mut OrchestrationState,
        cycle: u32,
        reason: EndReason,
        ended_at: DateTime<Utc>,
        message: Option<LastMessage>,
        tokens_used_percent: Option<f64>,
    ) -> Result<()> {
        if cycle != state.cycle_number {
            return Err(anyhow!(
                "cannot end cycle {cycle}: current cycle is {}",
                state.cycle_number
            ));
        }
        let status = reason.status();
        let mut next = state.clone();
        if let Some(last) = next.cycles.last_mut()
            && last.cycle == cycle
        {
            last.status = status;
            last.ended_at = Some(ended_at);
        }
        next.cycle_status = Some(status);
        if message.is_some() {
            next.last_message = message;
        }
        if tokens_used_percent.is_some() {
            next.tokens_used_percent = tokens_used_percent;
        }
        self.commit(state, next)
    }

    fn corrupt(&self, reason: String) -> StateCorrupt {
        StateCorrupt {
            path: self.path.clone(),
            reason,
        }
    }

    fn quarantine(&self, now: DateTime<Utc>) -> Result<PathBuf> {
        let file_name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("orchestration_state.json");
        let backup = self.path.with_file_name(format!(
            "{file_name}.corrupt-{}",
            now.format("%Y%m%dT%H%M%S%.3fZ")
        ));
        fs::rename(&self.path, &backup)
            .with_context(|| format!("move {} to {}", self.path.display(), backup.display()))?;
        Ok(backup)
    }
}

fn validate_schema(value: &Value) -> Result<(), String> {
    let validator = SCHEMA
        .as_ref()
        .map_err(|err| format!("embedded schema is invalid: {err}"))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let messages = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(format!("schema validation failed: {}", messages.join("; ")))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("create temp state {}", tmp_path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync temp state {}", tmp_path.display()))?;
    drop(file);
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}
