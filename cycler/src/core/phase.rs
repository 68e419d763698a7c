//! Orchestrator phases and the stall-confirmation vocabulary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{EndReason, LastMessage};

/// Where the orchestrator currently is in a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Idle,
    Spawning { cycle: u32 },
    Running { cycle: u32 },
    AwaitingStallConfirmation { cycle: u32, evidence: StallEvidence },
    Terminating { cycle: u32, reason: EndReason },
    PlanComplete,
}

impl Phase {
    pub fn cycle(&self) -> Option<u32> {
        match self {
            Phase::Spawning { cycle }
            | Phase::Running { cycle }
            | Phase::AwaitingStallConfirmation { cycle, .. }
            | Phase::Terminating { cycle, .. } => Some(*cycle),
            Phase::Idle | Phase::PlanComplete => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Spawning { .. } => "spawning",
            Phase::Running { .. } => "running",
            Phase::AwaitingStallConfirmation { .. } => "awaiting_stall_confirmation",
            Phase::Terminating { .. } => "terminating",
            Phase::PlanComplete => "plan_complete",
        }
    }

    /// Idle and PlanComplete have no live worker and accept no ticks.
    pub fn is_settled(&self) -> bool {
        matches!(self, Phase::Idle | Phase::PlanComplete)
    }
}

/// Everything an operator needs to judge a suspected stall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StallEvidence {
    pub plan_id: Option<String>,
    pub cycle: u32,
    pub worker_pid: Option<u32>,
    pub worker_alive: bool,
    pub last_message: Option<LastMessage>,
    pub elapsed_secs: u64,
    pub timeout_secs: u64,
    pub detected_at: DateTime<Utc>,
}

/// Operator (or policy) answer to a pending stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallDecision {
    /// Worker is truly stuck: end the cycle as `ended_by_stall` and move on.
    ConfirmTerminate,
    /// Worker looks busy: push the deadline forward.
    Extend,
    /// Stop watching this cycle entirely.
    DisableWatchdog,
}

impl StallDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            StallDecision::ConfirmTerminate => "confirm_terminate",
            StallDecision::Extend => "extend",
            StallDecision::DisableWatchdog => "disable_watchdog",
        }
    }
}

impl fmt::Display for StallDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StallDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "terminate" | "confirm_terminate" | "confirm-terminate" => {
                Ok(StallDecision::ConfirmTerminate)
            }
            "extend" => Ok(StallDecision::Extend),
            "disable-watchdog" | "disable_watchdog" => Ok(StallDecision::DisableWatchdog),
            other => Err(format!(
                "unknown stall decision '{other}' (expected terminate, extend, or disable-watchdog)"
            )),
        }
    }
}
