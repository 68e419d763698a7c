//! Resume rules: where a plan picks up after the supervisor (re)starts.
//!
//! The persisted `cycle_number` is never decremented or reset here. Only an
//! explicit fresh plan starts again at cycle 1.

use crate::core::types::{CycleStatus, OrchestrationState, WorkerRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Spawn a worker for `cycle`. `orphan` is a recorded worker from an ended
    /// cycle that is still alive and must be terminated first.
    Spawn {
        cycle: u32,
        orphan: Option<WorkerRecord>,
    },
    /// Cycle `cycle` is still live: reattach to its worker instead of spawning.
    Adopt { cycle: u32, worker: WorkerRecord },
    /// The plan already finished; only a fresh plan can run.
    AlreadyComplete { cycle: u32 },
}

/// Decide the resume point from persisted state and an OS liveness probe.
pub fn resume_point<F>(state: &OrchestrationState, mut is_alive: F) -> ResumePoint
where
    F: FnMut(&WorkerRecord) -> bool,
{
    let cycle = state.cycle_number;
    let Some(status) = state.cycle_status else {
        return ResumePoint::Spawn {
            cycle: cycle.max(1),
            orphan: None,
        };
    };

    let live_worker = state.worker.as_ref().filter(|worker| is_alive(worker)).cloned();

    match status {
        CycleStatus::Running => match live_worker {
            Some(worker) => ResumePoint::Adopt { cycle, worker },
            None => ResumePoint::Spawn {
                cycle,
                orphan: None,
            },
        },
        CycleStatus::EndedByPlanComplete => ResumePoint::AlreadyComplete { cycle },
        CycleStatus::EndedNormally | CycleStatus::EndedByStall | CycleStatus::EndedByStop => {
            ResumePoint::Spawn {
                cycle: cycle + 1,
                orphan: live_worker,
            }
        }
    }
}
