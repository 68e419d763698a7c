//! Shared deterministic types for the orchestration core.
//!
//! These types define the persisted contract (`orchestration_state.json`) and
//! the vocabulary the state machine speaks. They must not depend on I/O.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a single cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    EndedNormally,
    EndedByStall,
    EndedByPlanComplete,
    /// Operator cancelled the plan while the cycle was live.
    EndedByStop,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Running => "running",
            CycleStatus::EndedNormally => "ended_normally",
            CycleStatus::EndedByStall => "ended_by_stall",
            CycleStatus::EndedByPlanComplete => "ended_by_plan_complete",
            CycleStatus::EndedByStop => "ended_by_stop",
        }
    }
}

/// Discriminant of an inbound worker message, kept for `last_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    StatusUpdate,
    StepComplete,
    EndOfCycle,
    PlanComplete,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::StatusUpdate => "status_update",
            MessageKind::StepComplete => "step_complete",
            MessageKind::EndOfCycle => "end_of_cycle",
            MessageKind::PlanComplete => "plan_complete",
        }
    }
}

/// One completed step in the append-only plan history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub cycle: u32,
    /// Plan-global step number (not reset between cycles).
    pub step: u32,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used_percent: Option<f64>,
    pub completed_at: DateTime<Utc>,
}

/// One entry in the cycle log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle: u32,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub worker_pid: Option<u32>,
}

/// The worker process most recently attached to the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub directory: PathBuf,
}

/// Summary of the last well-formed message folded into the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    pub kind: MessageKind,
    pub summary: String,
    pub received_at: DateTime<Utc>,
}

/// Durable orchestration record (`.cycler/state/orchestration_state.json`).
///
/// `cycle_number == 0` means no cycle has been started for the plan yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub plan_id: Option<String>,
    pub cycle_number: u32,
    pub current_step: u32,
    pub cycle_status: Option<CycleStatus>,
    pub worker: Option<WorkerRecord>,
    pub last_message: Option<LastMessage>,
    pub tokens_used_percent: Option<f64>,
    pub history: Vec<StepRecord>,
    pub cycles: Vec<CycleRecord>,
    /// Incremented on every save.
    pub revision: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self {
            plan_id: None,
            cycle_number: 0,
            current_step: 0,
            cycle_status: None,
            worker: None,
            last_message: None,
            tokens_used_percent: None,
            history: Vec::new(),
            cycles: Vec::new(),
            revision: 0,
            last_updated: None,
        }
    }
}

impl OrchestrationState {
    /// Fresh state for a brand-new plan.
    pub fn for_plan(plan_id: &str) -> Self {
        Self {
            plan_id: Some(plan_id.to_string()),
            ..Self::default()
        }
    }

    pub fn last_step(&self) -> Option<&StepRecord> {
        self.history.last()
    }

    /// Steps recorded during `cycle`, in order.
    pub fn steps_in_cycle(&self, cycle: u32) -> impl Iterator<Item = &StepRecord> {
        self.history.iter().filter(move |record| record.cycle == cycle)
    }
}

/// Why a live cycle is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Normal,
    Stall,
    PlanComplete,
    Stop,
}

impl EndReason {
    pub fn status(self) -> CycleStatus {
        match self {
            EndReason::Normal => CycleStatus::EndedNormally,
            EndReason::Stall => CycleStatus::EndedByStall,
            EndReason::PlanComplete => CycleStatus::EndedByPlanComplete,
            EndReason::Stop => CycleStatus::EndedByStop,
        }
    }
}
