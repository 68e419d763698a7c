//! Supervisor shell for cycle-orchestrated coding-assistant workers.
//!
//! `cycler start` runs the supervisor loop in the foreground. The other
//! commands talk to it through files under `.cycler/state/`, except `send`,
//! which is what a worker uses to report over its cycle's channel.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};

use cycler::core::message::{WorkerMessage, parse_message};
use cycler::core::phase::StallDecision;
use cycler::errors::{ChannelUnavailable, NoStallPending, SpawnFailed};
use cycler::exit_codes;
use cycler::io::channel::ChannelSender;
use cycler::io::config::{ConfigOverrides, load_config};
use cycler::io::control::{FileArbiter, StopSignal, submit_decision};
use cycler::io::init::{CyclerPaths, InitOptions, init_cycler};
use cycler::io::registry::registry_from_config;
use cycler::io::worker::CommandLauncher;
use cycler::logging;
use cycler::looping::{LoopConfig, LoopStop, run_loop};
use cycler::orchestrator::{Orchestrator, OrchestratorConfig};
use cycler::start::{StartRequest, resolve_start_mode};
use cycler::status::{load_status, render_status};

#[derive(Parser)]
#[command(
    name = "cycler",
    version,
    about = "Supervise long-running coding-assistant workers cycle by cycle"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.cycler/` scaffolding and a default config.
    Init {
        /// Overwrite existing scaffolding (the state file is kept).
        #[arg(short, long)]
        force: bool,
    },
    /// Run the supervisor loop until the plan completes, is stopped, or a spawn fails.
    Start {
        /// Start a brand-new plan at cycle 1 instead of resuming.
        #[arg(long)]
        fresh: bool,
        /// Plan id for a fresh plan (default: plan-YYYYMMDD-HHMMSS).
        #[arg(long)]
        plan_id: Option<String>,
        /// Seconds without a worker message before a stall is raised.
        #[arg(long)]
        stall_timeout_secs: Option<u64>,
        /// Token usage percentage workers are told to stop at.
        #[arg(long)]
        token_threshold: Option<f64>,
        /// Directory workers run in.
        #[arg(long)]
        worker_dir: Option<PathBuf>,
    },
    /// Show the current plan, cycle, step and recent history.
    Status {
        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Ask the running supervisor to stop after terminating its worker.
    Stop,
    /// Answer a stall awaiting confirmation.
    Decide {
        /// terminate, extend, or disable-watchdog.
        decision: StallDecision,
    },
    /// Report progress to the supervisor (used by workers).
    Send {
        #[arg(value_enum)]
        kind: SendKind,
        /// Plan-global step number (step-complete).
        #[arg(long)]
        step: Option<u32>,
        /// What the step accomplished (step-complete).
        #[arg(long)]
        description: Option<String>,
        /// Self-reported token usage, 0-100.
        #[arg(long)]
        tokens: Option<f64>,
        /// Free text (status-update, end-of-cycle, plan-complete).
        #[arg(long)]
        text: Option<String>,
        /// Channel endpoint for the current cycle.
        #[arg(long, env = "CYCLER_CHANNEL")]
        channel: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SendKind {
    StatusUpdate,
    StepComplete,
    EndOfCycle,
    PlanComplete,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<SpawnFailed>().is_some() {
        exit_codes::SPAWN_FAILED
    } else if err.downcast_ref::<ChannelUnavailable>().is_some() {
        exit_codes::CHANNEL_UNAVAILABLE
    } else if err.downcast_ref::<NoStallPending>().is_some() {
        exit_codes::NO_STALL_PENDING
    } else {
        exit_codes::INVALID
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Start {
            fresh,
            plan_id,
            stall_timeout_secs,
            token_threshold,
            worker_dir,
        } => cmd_start(
            &root,
            StartRequest { fresh, plan_id },
            ConfigOverrides {
                stall_timeout_secs,
                token_threshold_percent: token_threshold,
                worker_directory: worker_dir,
            },
        ),
        Command::Status { json } => cmd_status(&root, json),
        Command::Stop => cmd_stop(&root),
        Command::Decide { decision } => cmd_decide(&root, decision),
        Command::Send {
            kind,
            step,
            description,
            tokens,
            text,
            channel,
        } => {
            let message = build_message(kind, step, description, tokens, text)?;
            let channel =
                channel.ok_or_else(|| anyhow!("missing --channel (or CYCLER_CHANNEL)"))?;
            cmd_send(&channel, &message)
        }
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_cycler(root, &InitOptions { force })?;
    println!("initialized {}", paths.cycler_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_start(root: &Path, request: StartRequest, overrides: ConfigOverrides) -> Result<i32> {
    let paths = CyclerPaths::new(root);
    if !paths.cycler_dir.exists() {
        init_cycler(root, &InitOptions { force: false }).context("cycler init")?;
    }
    let mut cfg = load_config(&paths.config_path)?;
    overrides.apply(&mut cfg).context("apply start options")?;

    let launcher = CommandLauncher::new(
        cfg.worker.command.clone(),
        cfg.worker.stdin_instructions,
        cfg.terminate_grace(),
    );
    let arbiter = FileArbiter::new(&paths.stall_decision_path);
    let mut orchestrator = Orchestrator::new(
        paths.clone(),
        OrchestratorConfig::from_config(&cfg, root),
        launcher,
        arbiter,
    )
    .with_registry(registry_from_config(&cfg.registry));

    let mode = resolve_start_mode(orchestrator.state(), &request, Utc::now())?;
    let stop = StopSignal::new(&paths.stop_request_path);
    // SIGINT/SIGTERM go through the same path as `cycler stop`, so the worker
    // is terminated and the cycle recorded as ended by stop.
    let on_signal = stop.clone();
    ctrlc::set_handler(move || {
        if let Err(err) = on_signal.request() {
            tracing::error!("failed to request stop on signal: {err:#}");
        }
    })
    .context("install signal handler")?;
    let loop_config = LoopConfig {
        poll_interval: cfg.poll_interval(),
    };
    let outcome = run_loop(&mut orchestrator, mode, &stop, &loop_config, |event| {
        println!("{event}");
    })?;

    match outcome.stop {
        LoopStop::PlanComplete { cycle } => {
            println!(
                "plan {} complete in cycle {cycle} ({} cycles this run)",
                outcome.plan_id.unwrap_or_default(),
                outcome.cycles_ended
            );
            Ok(exit_codes::OK)
        }
        LoopStop::Stopped => {
            println!("stopped at cycle {}", outcome.last_cycle);
            Ok(exit_codes::OK)
        }
        LoopStop::SpawnFailed { reason } => {
            eprintln!("{reason}");
            Ok(exit_codes::SPAWN_FAILED)
        }
    }
}

fn cmd_status(root: &Path, json: bool) -> Result<i32> {
    let report = load_status(&CyclerPaths::new(root))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_status(&report));
    }
    Ok(exit_codes::OK)
}

fn cmd_stop(root: &Path) -> Result<i32> {
    let paths = CyclerPaths::new(root);
    StopSignal::new(&paths.stop_request_path).request()?;
    println!("stop requested");
    Ok(exit_codes::OK)
}

fn cmd_decide(root: &Path, decision: StallDecision) -> Result<i32> {
    let record = submit_decision(&CyclerPaths::new(root), decision)?;
    println!("{} recorded for cycle {}", record.decision, record.cycle);
    Ok(exit_codes::OK)
}

fn cmd_send(channel: &Path, message: &WorkerMessage) -> Result<i32> {
    ChannelSender::new(channel).send(message)?;
    Ok(exit_codes::OK)
}

/// Build and validate the message exactly as the supervisor will parse it.
fn build_message(
    kind: SendKind,
    step: Option<u32>,
    description: Option<String>,
    tokens: Option<f64>,
    text: Option<String>,
) -> Result<WorkerMessage> {
    let message = match kind {
        SendKind::StatusUpdate => WorkerMessage::StatusUpdate {
            text,
            tokens_used_percent: tokens,
        },
        SendKind::StepComplete => WorkerMessage::StepComplete {
            step,
            description: description.or(text),
            tokens_used_percent: tokens,
        },
        SendKind::EndOfCycle => WorkerMessage::EndOfCycle {
            text,
            tokens_used_percent: tokens,
        },
        SendKind::PlanComplete => WorkerMessage::PlanComplete {
            text,
            tokens_used_percent: tokens,
        },
    };
    parse_message(&message.to_record())?;
    Ok(message)
}
