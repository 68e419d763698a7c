//! The cooperative supervisor loop behind `cycler start`.
//!
//! One thread, one loop: poll the stop request, tick the orchestrator, sleep.
//! The loop is the top-level error guard. Only [`SpawnFailed`] (or an error
//! that leaves the orchestrator idle) ends it early.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::core::phase::Phase;
use crate::errors::SpawnFailed;
use crate::io::control::{StallArbiter, StopSignal};
use crate::io::worker::WorkerLauncher;
use crate::orchestrator::{Orchestrator, OrchestratorEvent, StartMode};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The worker reported `plan_complete`.
    PlanComplete { cycle: u32 },
    /// The operator asked to stop.
    Stopped,
    /// A worker could not be launched. Not retried.
    SpawnFailed { reason: String },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub plan_id: Option<String>,
    /// Cycle number when the loop returned.
    pub last_cycle: u32,
    pub cycles_ended: u32,
    pub stop: LoopStop,
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub poll_interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Start `mode` and tick until the plan completes, the operator stops it, or
/// a spawn fails. `on_event` sees every orchestrator event in order.
pub fn run_loop<L, A, F>(
    orchestrator: &mut Orchestrator<L, A>,
    mode: StartMode,
    stop: &StopSignal,
    config: &LoopConfig,
    mut on_event: F,
) -> Result<LoopOutcome>
where
    L: WorkerLauncher,
    A: StallArbiter,
    F: FnMut(&OrchestratorEvent),
{
    // A request left over from a previous run must not stop this one.
    if stop.take()? {
        debug!("discarded stale stop request");
    }

    let mut cycles_ended = 0u32;
    let mut emit = |events: Vec<OrchestratorEvent>, cycles_ended: &mut u32| {
        for event in &events {
            if matches!(event, OrchestratorEvent::CycleEnded { .. }) {
                *cycles_ended += 1;
            }
            on_event(event);
        }
    };

    match orchestrator.start(mode, Instant::now()) {
        Ok(events) => emit(events, &mut cycles_ended),
        Err(err) => {
            if err.downcast_ref::<SpawnFailed>().is_some() {
                return Ok(outcome(
                    orchestrator,
                    cycles_ended,
                    LoopStop::SpawnFailed {
                        reason: format!("{err:#}"),
                    },
                ));
            }
            return Err(err);
        }
    }

    loop {
        match stop.take() {
            Ok(true) => {
                info!("stop requested");
                match orchestrator.stop() {
                    Ok(events) => emit(events, &mut cycles_ended),
                    Err(err) => error!("stop did not complete, retrying: {err:#}"),
                }
            }
            Ok(false) => {}
            Err(err) => warn!("failed to read stop request: {err:#}"),
        }

        if !orchestrator.phase().is_settled() {
            match orchestrator.tick(Instant::now()) {
                Ok(events) => emit(events, &mut cycles_ended),
                Err(err) => {
                    if err.downcast_ref::<SpawnFailed>().is_some() {
                        return Ok(outcome(
                            orchestrator,
                            cycles_ended,
                            LoopStop::SpawnFailed {
                                reason: format!("{err:#}"),
                            },
                        ));
                    }
                    error!("tick failed: {err:#}");
                    if matches!(orchestrator.phase(), Phase::Idle) {
                        return Err(err);
                    }
                }
            }
        }

        match orchestrator.phase() {
            Phase::PlanComplete => {
                let cycle = orchestrator.state().cycle_number;
                return Ok(outcome(
                    orchestrator,
                    cycles_ended,
                    LoopStop::PlanComplete { cycle },
                ));
            }
            Phase::Idle => return Ok(outcome(orchestrator, cycles_ended, LoopStop::Stopped)),
            _ => {}
        }

        thread::sleep(config.poll_interval);
    }
}

fn outcome<L: WorkerLauncher, A: StallArbiter>(
    orchestrator: &Orchestrator<L, A>,
    cycles_ended: u32,
    stop: LoopStop,
) -> LoopOutcome {
    LoopOutcome {
        plan_id: orchestrator.state().plan_id.clone(),
        last_cycle: orchestrator.state().cycle_number,
        cycles_ended,
        stop,
    }
}
