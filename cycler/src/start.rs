//! Plan identity and start-mode selection for `cycler start`.
//!
//! A plan is identified by a stable `plan_id`. Only `--fresh` supersedes the
//! persisted plan; every other start resumes it where the state says it left
//! off.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info};

use crate::core::types::OrchestrationState;
use crate::orchestrator::StartMode;

static PLAN_ID_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$"));

/// What the operator asked for on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartRequest {
    pub fresh: bool,
    pub plan_id: Option<String>,
}

pub fn validate_plan_id(id: &str) -> Result<()> {
    let re = PLAN_ID_RE
        .as_ref()
        .map_err(|err| anyhow!("compile plan id pattern: {err}"))?;
    if re.is_match(id) {
        Ok(())
    } else {
        Err(anyhow!(
            "invalid plan id '{id}' (expected [A-Za-z0-9][A-Za-z0-9._-]{{0,63}})"
        ))
    }
}

/// Default plan id: `plan-YYYYMMDD-HHMMSS` in UTC.
pub fn generate_plan_id(now: DateTime<Utc>) -> String {
    format!("plan-{}", now.format("%Y%m%d-%H%M%S"))
}

/// Decide between a fresh plan and resuming the persisted one.
///
/// - `--fresh` always starts a new plan (with the given or a generated id).
/// - Without `--fresh`, an empty state starts a new plan.
/// - Otherwise the persisted plan resumes; naming a different plan is refused.
pub fn resolve_start_mode(
    state: &OrchestrationState,
    request: &StartRequest,
    now: DateTime<Utc>,
) -> Result<StartMode> {
    if let Some(id) = &request.plan_id {
        validate_plan_id(id)?;
    }
    let persisted = state.plan_id.as_deref();

    if request.fresh || persisted.is_none() {
        let plan_id = request
            .plan_id
            .clone()
            .unwrap_or_else(|| generate_plan_id(now));
        info!(plan = %plan_id, superseded = ?persisted, "starting fresh plan");
        return Ok(StartMode::Fresh { plan_id });
    }

    match (&request.plan_id, persisted) {
        (Some(requested), Some(current)) if requested != current => Err(anyhow!(
            "plan {current} is in progress; pass --fresh to start plan {requested}"
        )),
        _ => {
            debug!(plan = ?persisted, cycle = state.cycle_number, "resuming plan");
            Ok(StartMode::Resume)
        }
    }
}
