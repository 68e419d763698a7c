//! File-based control plane between the shell and a running supervisor.
//!
//! The supervisor loop owns the state file. Other `cycler` invocations talk
//! to it only by dropping small files under `.cycler/state/`: a stop request
//! and stall decisions. The loop publishes pending stall evidence the same way.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::phase::{StallDecision, StallEvidence};
use crate::errors::NoStallPending;
use crate::io::init::CyclerPaths;

/// Answers a pending stall. `Ok(None)` means "no decision yet, keep waiting".
pub trait StallArbiter {
    fn decide(&self, evidence: &StallEvidence) -> Result<Option<StallDecision>>;
}

/// A decision as written to `stall_decision.json`.
///
/// Bound to one stall: `cycle` plus the evidence's `detected_at`. A later
/// stall in the same cycle has a different `detected_at` and ignores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub cycle: u32,
    /// `detected_at` of the evidence this decision answers.
    pub stall_detected_at: DateTime<Utc>,
    pub decision: StallDecision,
    pub decided_at: DateTime<Utc>,
}

/// Arbiter that waits for `cycler decide` to drop a decision file.
#[derive(Debug, Clone)]
pub struct FileArbiter {
    decision_path: PathBuf,
}

impl FileArbiter {
    pub fn new(decision_path: impl Into<PathBuf>) -> Self {
        Self {
            decision_path: decision_path.into(),
        }
    }
}

impl StallArbiter for FileArbiter {
    fn decide(&self, evidence: &StallEvidence) -> Result<Option<StallDecision>> {
        let record: Option<DecisionRecord> = match read_json(&self.decision_path) {
            Ok(record) => record,
            Err(err) => {
                warn!("discarding unreadable stall decision: {err:#}");
                remove_if_exists(&self.decision_path)?;
                return Ok(None);
            }
        };
        let Some(record) = record else {
            return Ok(None);
        };
        remove_if_exists(&self.decision_path)?;
        if record.cycle != evidence.cycle || record.stall_detected_at != evidence.detected_at {
            warn!(
                decided_for = record.cycle,
                decided_stall = %record.stall_detected_at.to_rfc3339(),
                pending = evidence.cycle,
                pending_stall = %evidence.detected_at.to_rfc3339(),
                "discarding stall decision for another stall"
            );
            return Ok(None);
        }
        info!(cycle = record.cycle, decision = %record.decision, "stall decision received");
        Ok(Some(record.decision))
    }
}

/// Answer the stall currently awaiting confirmation.
///
/// Fails with [`NoStallPending`] when no evidence is published.
pub fn submit_decision(paths: &CyclerPaths, decision: StallDecision) -> Result<DecisionRecord> {
    let Some(evidence) = read_evidence(&paths.stall_evidence_path)? else {
        return Err(NoStallPending.into());
    };
    let record = DecisionRecord {
        cycle: evidence.cycle,
        stall_detected_at: evidence.detected_at,
        decision,
        decided_at: Utc::now(),
    };
    write_json_atomic(&paths.stall_decision_path, &record)?;
    Ok(record)
}

pub fn write_evidence(path: &Path, evidence: &StallEvidence) -> Result<()> {
    write_json_atomic(path, evidence)
}

pub fn read_evidence(path: &Path) -> Result<Option<StallEvidence>> {
    read_json(path)
}

pub fn clear_evidence(path: &Path) -> Result<()> {
    remove_if_exists(path)
}

/// Drop an unconsumed decision, e.g. one left over from an earlier run.
pub fn clear_decision(path: &Path) -> Result<()> {
    remove_if_exists(path)
}

/// Operator stop request (`state/stop.request`).
#[derive(Debug, Clone)]
pub struct StopSignal {
    path: PathBuf,
}

impl StopSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn request(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&self.path, format!("{}\n", Utc::now().to_rfc3339()))
            .with_context(|| format!("write {}", self.path.display()))
    }

    pub fn is_requested(&self) -> bool {
        self.path.exists()
    }

    /// Consume a pending request. Returns whether one was pending.
    pub fn take(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("stop request consumed");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove {}", self.path.display())),
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
