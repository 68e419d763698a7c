//! Startup instructions rendered for each spawned worker.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{OrchestrationState, StepRecord};

const STARTUP_TEMPLATE: &str = include_str!("prompts/startup.md");

/// Step as shown to the worker.
#[derive(Debug, Clone, Serialize)]
struct StepContext {
    cycle: u32,
    step: u32,
    task: String,
}

impl From<&StepRecord> for StepContext {
    fn from(record: &StepRecord) -> Self {
        Self {
            cycle: record.cycle,
            step: record.step,
            task: record.task.clone(),
        }
    }
}

/// Inputs for the startup instructions of one cycle.
#[derive(Debug, Clone)]
pub struct StartupInputs {
    pub plan_id: String,
    pub cycle: u32,
    pub channel_path: PathBuf,
    pub state_path: PathBuf,
    pub plan_path: PathBuf,
    pub token_threshold_percent: f64,
    pub stall_timeout_secs: u64,
    /// How many trailing history entries to include.
    pub history_tail: usize,
}

/// Render the instructions a worker starts with.
pub fn render_startup(inputs: &StartupInputs, state: &OrchestrationState) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("startup", STARTUP_TEMPLATE)
        .context("load startup template")?;
    let template = env.get_template("startup")?;

    let skip = state.history.len().saturating_sub(inputs.history_tail);
    let recent: Vec<StepContext> = state.history.iter().skip(skip).map(StepContext::from).collect();
    let rendered = template
        .render(context! {
            plan_id => inputs.plan_id,
            cycle => inputs.cycle,
            next_step => state.current_step + 1,
            last_step => state.last_step().map(StepContext::from),
            recent_steps => recent,
            token_threshold => format_percent(inputs.token_threshold_percent),
            stall_timeout_secs => inputs.stall_timeout_secs,
            channel => display(&inputs.channel_path),
            state_file => display(&inputs.state_path),
            plan_file => display(&inputs.plan_path),
        })
        .context("render startup instructions")?;
    Ok(rendered)
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn format_percent(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}
