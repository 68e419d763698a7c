//! HTTP route handlers for the UI API.

use std::fs;
use std::path::Path as FsPath;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use serde::Serialize;
use tracing::warn;

use cycler::core::phase::StallEvidence;
use cycler::io::control::read_evidence;
use cycler::io::cycle_log::{CycleMeta, CyclePaths, read_cycle_meta};
use cycler::start::validate_plan_id;
use cycler::status::{StatusReport, load_status};

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(get_state))
        .route("/stall", get(get_stall))
        .route("/cycles", get(list_cycles))
        .route("/cycles/{plan_id}/{cycle}", get(get_cycle))
        .route("/cycles/{plan_id}/{cycle}/worker.log", get(get_worker_log))
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/state - persisted state plus worker liveness and pending stall.
async fn get_state(State(state): State<AppState>) -> Result<Json<StatusReport>, StatusCode> {
    load_status(&state.paths).map(Json).map_err(|err| {
        warn!(error = %format!("{err:#}"), "load status");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// GET /api/stall - evidence for the stall awaiting confirmation, 404 if none.
async fn get_stall(State(state): State<AppState>) -> Result<Json<StallEvidence>, StatusCode> {
    match read_evidence(&state.paths.stall_evidence_path) {
        Ok(Some(evidence)) => Ok(Json(evidence)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "read stall evidence");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct CyclesResponse {
    pub plans: Vec<PlanEntry>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub plan_id: String,
    pub cycles: Vec<u32>,
}

/// GET /api/cycles - every plan with artifacts and its cycle numbers.
async fn list_cycles(State(state): State<AppState>) -> Result<Json<CyclesResponse>, StatusCode> {
    collect_cycles(&state.paths.cycles_dir)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Scan `cycles/<plan>/<N>/`, ignoring entries that are not cycle directories.
pub fn collect_cycles(cycles_dir: &FsPath) -> std::io::Result<CyclesResponse> {
    if !cycles_dir.exists() {
        return Ok(CyclesResponse { plans: vec![] });
    }

    let mut plans = Vec::new();
    for entry in fs::read_dir(cycles_dir)?.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(plan_id) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let mut cycles: Vec<u32> = fs::read_dir(&path)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|cycle_entry| cycle_entry.path())
                    .filter(|cycle_path| cycle_path.is_dir())
                    .filter_map(|cycle_path| {
                        cycle_path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .and_then(|name| name.parse::<u32>().ok())
                    })
                    .collect()
            })
            .unwrap_or_default();
        cycles.sort_unstable();
        plans.push(PlanEntry {
            plan_id: plan_id.to_string(),
            cycles,
        });
    }

    plans.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));
    Ok(CyclesResponse { plans })
}

#[derive(Serialize)]
struct CycleDetail {
    plan_id: String,
    cycle: u32,
    /// Absent while the cycle is still running.
    meta: Option<CycleMeta>,
    instructions: Option<String>,
}

/// GET /api/cycles/{plan_id}/{cycle} - meta.json and rendered instructions.
async fn get_cycle(
    State(state): State<AppState>,
    Path((plan_id, cycle)): Path<(String, u32)>,
) -> Result<Json<CycleDetail>, StatusCode> {
    let paths = cycle_paths(&state, &plan_id, cycle)?;
    if !paths.dir.is_dir() {
        return Err(StatusCode::NOT_FOUND);
    }

    let meta = read_cycle_meta(&paths).map_err(|err| {
        warn!(error = %format!("{err:#}"), plan_id = %plan_id, cycle, "read cycle meta");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let instructions = fs::read_to_string(&paths.instructions_path).ok();

    Ok(Json(CycleDetail {
        plan_id,
        cycle,
        meta,
        instructions,
    }))
}

/// GET /api/cycles/{plan_id}/{cycle}/worker.log - worker output so far.
async fn get_worker_log(
    State(state): State<AppState>,
    Path((plan_id, cycle)): Path<(String, u32)>,
) -> Result<String, StatusCode> {
    let paths = cycle_paths(&state, &plan_id, cycle)?;
    if !paths.log_path.exists() {
        return Ok(String::new());
    }
    fs::read(&paths.log_path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Plan ids come from the URL; only well-formed ones may name a directory.
fn cycle_paths(state: &AppState, plan_id: &str, cycle: u32) -> Result<CyclePaths, StatusCode> {
    validate_plan_id(plan_id).map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok(CyclePaths::new(&state.paths, plan_id, cycle))
}
