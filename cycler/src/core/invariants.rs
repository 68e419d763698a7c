//! Semantic invariants of the persisted state not expressible via JSON Schema.

use crate::core::types::{CycleStatus, OrchestrationState};

/// Check semantic invariants:
/// - History step numbers strictly increase
/// - History cycles never decrease and never exceed `cycle_number`
/// - `current_step` equals the last recorded step (0 when history is empty)
/// - Cycle log numbers strictly increase and end at `cycle_number`
/// - `cycle_status` is present iff a cycle has been started
/// - At most the last logged cycle may be `running`
pub fn validate_invariants(state: &OrchestrationState) -> Vec<String> {
    let mut errors = Vec::new();

    for pair in state.history.windows(2) {
        if pair[1].step <= pair[0].step {
            errors.push(format!(
                "history: step {} follows step {} (steps must strictly increase)",
                pair[1].step, pair[0].step
            ));
        }
        if pair[1].cycle < pair[0].cycle {
            errors.push(format!(
                "history: step {} in cycle {} follows cycle {}",
                pair[1].step, pair[1].cycle, pair[0].cycle
            ));
        }
    }
    if let Some(record) = state.history.iter().find(|r| r.cycle > state.cycle_number) {
        errors.push(format!(
            "history: step {} claims cycle {} beyond cycle_number {}",
            record.step, record.cycle, state.cycle_number
        ));
    }

    let last_step = state.history.last().map(|r| r.step).unwrap_or(0);
    if state.current_step != last_step {
        errors.push(format!(
            "current_step {} does not match last recorded step {}",
            state.current_step, last_step
        ));
    }

    for pair in state.cycles.windows(2) {
        if pair[1].cycle <= pair[0].cycle {
            errors.push(format!(
                "cycles: cycle {} follows cycle {} (must strictly increase)",
                pair[1].cycle, pair[0].cycle
            ));
        }
    }
    if let Some(last) = state.cycles.last()
        && last.cycle != state.cycle_number
    {
        errors.push(format!(
            "cycles: last logged cycle {} differs from cycle_number {}",
            last.cycle, state.cycle_number
        ));
    }
    let logged = state.cycles.len();
    for record in state.cycles.iter().take(logged.saturating_sub(1)) {
        if record.status == CycleStatus::Running {
            errors.push(format!("cycles: earlier cycle {} still running", record.cycle));
        }
    }

    match (state.cycle_number, state.cycle_status) {
        (0, Some(status)) => errors.push(format!(
            "cycle_status {} recorded before any cycle started",
            status.as_str()
        )),
        (n, None) if n > 0 => errors.push(format!("cycle {n} has no cycle_status")),
        _ => {}
    }

    errors
}
