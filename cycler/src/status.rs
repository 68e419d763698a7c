//! Display-only view for `cycler status`.
//!
//! Never writes: a corrupt state file is reported, not quarantined. Recovery
//! happens when the supervisor loop next loads it.

use std::fmt::Write as _;

use anyhow::Result;
use serde::Serialize;

use crate::core::phase::StallEvidence;
use crate::core::types::{CycleStatus, OrchestrationState};
use crate::io::control::read_evidence;
use crate::io::init::CyclerPaths;
use crate::io::process::pid_alive;
use crate::io::state_store::StateStore;

/// How many trailing history entries the text view shows.
const HISTORY_LINES: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: OrchestrationState,
    /// Set when the state file failed validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrupt: Option<String>,
    /// Liveness of the recorded worker while its cycle is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_alive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_stall: Option<StallEvidence>,
}

pub fn load_status(paths: &CyclerPaths) -> Result<StatusReport> {
    let (state, corrupt) = match StateStore::new(&paths.state_path).load_checked() {
        Ok(state) => (state.unwrap_or_default(), None),
        Err(err) => (OrchestrationState::default(), Some(err.to_string())),
    };
    let worker_alive = match (&state.worker, state.cycle_status) {
        (Some(worker), Some(CycleStatus::Running)) => Some(pid_alive(worker.pid)),
        _ => None,
    };
    let pending_stall = read_evidence(&paths.stall_evidence_path)?;
    Ok(StatusReport {
        state,
        corrupt,
        worker_alive,
        pending_stall,
    })
}

/// Human-readable summary.
pub fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    let state = &report.state;

    if let Some(reason) = &report.corrupt {
        let _ = writeln!(out, "state: CORRUPT ({reason})");
    }
    let Some(plan_id) = state.plan_id.as_deref() else {
        out.push_str("no plan (run `cycler start`)\n");
        return out;
    };

    let _ = writeln!(out, "plan:    {plan_id}");
    let status = state.cycle_status.map_or("not started", CycleStatus::as_str);
    let _ = writeln!(out, "cycle:   {} ({status})", state.cycle_number);
    let _ = writeln!(out, "step:    {}", state.current_step);
    if let Some(worker) = &state.worker {
        let liveness = match report.worker_alive {
            Some(true) => ", alive",
            Some(false) => ", not running",
            None => "",
        };
        let _ = writeln!(
            out,
            "worker:  pid {} in {}{liveness}",
            worker.pid,
            worker.directory.display()
        );
    }
    if let Some(percent) = state.tokens_used_percent {
        let _ = writeln!(out, "tokens:  {percent}% used");
    }
    if let Some(message) = &state.last_message {
        let _ = writeln!(
            out,
            "last:    {} at {}: {}",
            message.kind.as_str(),
            message.received_at.to_rfc3339(),
            message.summary
        );
    }
    if let Some(evidence) = &report.pending_stall {
        let _ = writeln!(
            out,
            "STALL:   cycle {} silent for {}s (timeout {}s); run `cycler decide terminate|extend|disable-watchdog`",
            evidence.cycle, evidence.elapsed_secs, evidence.timeout_secs
        );
    }

    if !state.history.is_empty() {
        out.push_str("history:\n");
        let skip = state.history.len().saturating_sub(HISTORY_LINES);
        for record in state.history.iter().skip(skip) {
            let _ = writeln!(
                out,
                "  c{} s{}  {}",
                record.cycle, record.step, record.task
            );
        }
    }
    out
}
