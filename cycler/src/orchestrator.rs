//! The cycle orchestrator.
//!
//! Owns the persisted [`OrchestrationState`], at most one worker and at most
//! one channel. All transitions happen inside [`Orchestrator::start`],
//! [`Orchestrator::tick`], [`Orchestrator::resolve_stall`] and
//! [`Orchestrator::stop`], each driven by the single-threaded supervisor loop
//! with an explicit `now`.
//!
//! A stall never terminates a worker on its own: the watchdog only moves the
//! orchestrator to `AwaitingStallConfirmation`, and termination requires an
//! explicit `ConfirmTerminate` from the arbiter.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::message::WorkerMessage;
use crate::core::phase::{Phase, StallDecision, StallEvidence};
use crate::core::resume::{ResumePoint, resume_point};
use crate::core::types::{
    CycleStatus, EndReason, LastMessage, MessageKind, OrchestrationState, StepRecord, WorkerRecord,
};
use crate::core::watchdog::Watchdog;
use crate::errors::{MalformedMessage, NoStallPending, SpawnFailed};
use crate::io::channel::{MessageChannel, Received, sweep_stale_channels};
use crate::io::config::CyclerConfig;
use crate::io::control::{StallArbiter, clear_decision, clear_evidence, write_evidence};
use crate::io::cycle_log::{CycleMeta, CyclePaths, write_cycle_meta, write_instructions};
use crate::io::init::CyclerPaths;
use crate::io::prompt::{StartupInputs, render_startup};
use crate::io::registry::{NoopRegistry, ServiceRegistry};
use crate::io::state_store::StateStore;
use crate::io::worker::{SpawnRequest, WorkerLauncher, WorkerProcess};

/// Orchestrator tunables, resolved from [`CyclerConfig`] plus CLI overrides.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub stall_timeout: Duration,
    pub token_threshold_percent: f64,
    pub worker_directory: PathBuf,
    pub history_tail: usize,
    pub registry_name: String,
    pub heartbeat_interval: Duration,
}

impl OrchestratorConfig {
    pub fn from_config(cfg: &CyclerConfig, root: &Path) -> Self {
        Self {
            stall_timeout: cfg.stall_timeout(),
            token_threshold_percent: cfg.token_threshold_percent,
            worker_directory: cfg.worker_directory(root),
            history_tail: cfg.history_in_instructions,
            registry_name: cfg.registry.name.clone(),
            heartbeat_interval: Duration::from_secs(cfg.registry.heartbeat_interval_secs),
        }
    }
}

/// How [`Orchestrator::start`] picks its first cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// Supersede the persisted state with a brand-new plan at cycle 1.
    Fresh { plan_id: String },
    /// Continue the persisted plan without resetting its cycle number.
    Resume,
}

/// Something observable that happened during a call into the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    CycleStarted { cycle: u32, pid: u32 },
    WorkerAdopted { cycle: u32, pid: u32 },
    OrphanTerminated { pid: u32 },
    StepRecorded { cycle: u32, step: u32, task: String },
    StaleStepIgnored { cycle: u32, step: u32, current_step: u32 },
    StatusReceived { cycle: u32, summary: String },
    TokenThresholdReached { cycle: u32, percent: f64 },
    MalformedMessage { cycle: u32, error: MalformedMessage },
    StallDetected(StallEvidence),
    StallResolved { cycle: u32, decision: StallDecision },
    /// A well-formed message arrived while a stall was pending.
    StallCleared { cycle: u32 },
    CycleEnded { cycle: u32, status: CycleStatus },
    PlanComplete { cycle: u32 },
    Stopped,
}

impl fmt::Display for OrchestratorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorEvent::CycleStarted { cycle, pid } => {
                write!(f, "cycle {cycle}: worker started (pid {pid})")
            }
            OrchestratorEvent::WorkerAdopted { cycle, pid } => {
                write!(f, "cycle {cycle}: adopted running worker (pid {pid})")
            }
            OrchestratorEvent::OrphanTerminated { pid } => {
                write!(f, "terminated orphaned worker (pid {pid})")
            }
            OrchestratorEvent::StepRecorded { cycle, step, task } => {
                write!(f, "cycle {cycle}: step {step} complete: {task}")
            }
            OrchestratorEvent::StaleStepIgnored {
                cycle,
                step,
                current_step,
            } => write!(
                f,
                "cycle {cycle}: ignored step {step} (already at step {current_step})"
            ),
            OrchestratorEvent::StatusReceived { cycle, summary } => {
                write!(f, "cycle {cycle}: status: {summary}")
            }
            OrchestratorEvent::TokenThresholdReached { cycle, percent } => {
                write!(f, "cycle {cycle}: worker reports {percent}% token usage")
            }
            OrchestratorEvent::MalformedMessage { cycle, error } => {
                write!(f, "cycle {cycle}: discarded {error}")
            }
            OrchestratorEvent::StallDetected(evidence) => write!(
                f,
                "cycle {}: no message for {}s (timeout {}s); awaiting decision \
                 (cycler decide terminate|extend|disable-watchdog)",
                evidence.cycle, evidence.elapsed_secs, evidence.timeout_secs
            ),
            OrchestratorEvent::StallResolved { cycle, decision } => {
                write!(f, "cycle {cycle}: stall resolved: {decision}")
            }
            OrchestratorEvent::StallCleared { cycle } => {
                write!(f, "cycle {cycle}: worker reported in; stall cleared")
            }
            OrchestratorEvent::CycleEnded { cycle, status } => {
                write!(f, "cycle {cycle}: {}", status.as_str())
            }
            OrchestratorEvent::PlanComplete { cycle } => {
                write!(f, "plan complete after cycle {cycle}")
            }
            OrchestratorEvent::Stopped => write!(f, "stopped"),
        }
    }
}

type Events = Vec<OrchestratorEvent>;

pub struct Orchestrator<L: WorkerLauncher, A: StallArbiter> {
    paths: CyclerPaths,
    config: OrchestratorConfig,
    launcher: L,
    arbiter: A,
    registry: Box<dyn ServiceRegistry>,
    registered: bool,
    last_heartbeat: Option<Instant>,
    store: StateStore,
    state: OrchestrationState,
    phase: Phase,
    worker: Option<L::Worker>,
    channel: Option<MessageChannel>,
    /// Records drained from the channel but not yet applied.
    inbox: VecDeque<Received>,
    watchdog: Option<Watchdog>,
    token_warned: bool,
    stop_requested: bool,
}

impl<L: WorkerLauncher, A: StallArbiter> Orchestrator<L, A> {
    /// Build an idle orchestrator over the persisted state in `paths`.
    pub fn new(paths: CyclerPaths, config: OrchestratorConfig, launcher: L, arbiter: A) -> Self {
        let store = StateStore::new(&paths.state_path);
        let state = store.load();
        Self {
            paths,
            config,
            launcher,
            arbiter,
            registry: Box::new(NoopRegistry),
            registered: false,
            last_heartbeat: None,
            store,
            state,
            phase: Phase::Idle,
            worker: None,
            channel: None,
            inbox: VecDeque::new(),
            watchdog: None,
            token_warned: false,
            stop_requested: false,
        }
    }

    pub fn with_registry(mut self, registry: Box<dyn ServiceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Last persisted state (in memory, identical to disk).
    pub fn state(&self) -> &OrchestrationState {
        &self.state
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().map(WorkerProcess::pid)
    }

    pub fn watchdog(&self) -> Option<&Watchdog> {
        self.watchdog.as_ref()
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn arbiter(&self) -> &A {
        &self.arbiter
    }

    pub fn paths(&self) -> &CyclerPaths {
        &self.paths
    }

    /// Begin (or resume) a plan and start its first worker.
    ///
    /// A [`SpawnFailed`] error leaves the orchestrator `Idle`.
    #[instrument(skip_all, fields(mode = ?mode))]
    pub fn start(&mut self, mode: StartMode, now: Instant) -> Result<Events> {
        if !self.phase.is_settled() {
            return Err(anyhow!("orchestrator is already {}", self.phase.name()));
        }
        self.stop_requested = false;
        self.clear_leftovers();

        let mut events = Vec::new();
        let cycle = match mode {
            StartMode::Fresh { plan_id } => {
                if let Some(pid) = self.terminate_recorded_worker()? {
                    events.push(OrchestratorEvent::OrphanTerminated { pid });
                }
                let mut fresh = OrchestrationState::for_plan(&plan_id);
                self.store
                    .save(&mut fresh)
                    .context("persist fresh plan state")?;
                self.state = fresh;
                info!(plan = %plan_id, "fresh plan started");
                1
            }
            StartMode::Resume => {
                let plan_id = self.plan_id()?;
                let launcher = &self.launcher;
                match resume_point(&self.state, |worker| launcher.probe(worker)) {
                    ResumePoint::AlreadyComplete { cycle } => {
                        return Err(anyhow!(
                            "plan {plan_id} already completed in cycle {cycle} (start a fresh plan)"
                        ));
                    }
                    ResumePoint::Adopt { cycle, worker } => {
                        self.adopt(cycle, &worker, now)?;
                        self.register();
                        events.push(OrchestratorEvent::WorkerAdopted {
                            cycle,
                            pid: worker.pid,
                        });
                        return Ok(events);
                    }
                    ResumePoint::Spawn { cycle, orphan } => {
                        if let Some(record) = orphan {
                            let mut orphan = self.launcher.adopt(&record);
                            orphan
                                .terminate()
                                .context("terminate orphaned worker")?;
                            events.push(OrchestratorEvent::OrphanTerminated { pid: record.pid });
                        }
                        info!(plan = %plan_id, cycle, "resuming plan");
                        cycle
                    }
                }
            }
        };

        self.register();
        events.extend(self.spawn_cycle(cycle, now)?);
        Ok(events)
    }

    /// Advance one step of the cooperative loop.
    pub fn tick(&mut self, now: Instant) -> Result<Events> {
        self.heartbeat(now);
        match self.phase.clone() {
            Phase::Idle | Phase::PlanComplete => Ok(Vec::new()),
            Phase::Spawning { cycle } => self.spawn_cycle(cycle, now),
            Phase::Running { cycle } => {
                let mut events = self.process_inbox(cycle, now)?;
                if matches!(self.phase, Phase::Running { .. }) && self.watchdog_expired(now) {
                    events.push(self.raise_stall(cycle, now));
                }
                Ok(events)
            }
            Phase::AwaitingStallConfirmation { cycle, evidence } => {
                let mut events = self.process_inbox(cycle, now)?;
                if matches!(self.phase, Phase::AwaitingStallConfirmation { .. })
                    && let Some(decision) = self.arbiter.decide(&evidence)?
                {
                    events.extend(self.resolve_stall(decision, now)?);
                }
                Ok(events)
            }
            Phase::Terminating { cycle, reason } => self.finish_cycle(cycle, reason),
        }
    }

    /// Apply an explicit answer to the pending stall.
    #[instrument(skip(self, now))]
    pub fn resolve_stall(&mut self, decision: StallDecision, now: Instant) -> Result<Events> {
        let Phase::AwaitingStallConfirmation { cycle, .. } = self.phase else {
            return Err(NoStallPending.into());
        };

        let mut events = vec![OrchestratorEvent::StallResolved { cycle, decision }];
        match decision {
            StallDecision::ConfirmTerminate => {
                info!(cycle, "stall confirmed; ending cycle");
                events.extend(self.end_cycle(cycle, EndReason::Stall, None, None)?);
                return Ok(events);
            }
            StallDecision::Extend => {
                if let Some(watchdog) = self.watchdog.as_mut() {
                    watchdog.reset(now);
                }
                info!(cycle, "stall extended; watchdog deadline pushed forward");
            }
            StallDecision::DisableWatchdog => {
                if let Some(watchdog) = self.watchdog.as_mut() {
                    watchdog.disable();
                }
                error!(
                    cycle,
                    "watchdog disabled for the rest of this cycle; stalls will not be detected"
                );
            }
        }
        self.phase = Phase::Running { cycle };
        self.clear_pending_stall();
        Ok(events)
    }

    /// Cancel the plan from any phase, terminating a live worker.
    #[instrument(skip_all)]
    pub fn stop(&mut self) -> Result<Events> {
        self.stop_requested = true;
        match self.phase.clone() {
            Phase::Idle | Phase::PlanComplete => Ok(Vec::new()),
            Phase::Spawning { cycle } => {
                self.channel = None;
                let mut events = Vec::new();
                if self.state.cycle_number == cycle
                    && self.state.cycle_status == Some(CycleStatus::Running)
                {
                    self.store
                        .record_cycle_end(
                            &mut self.state,
                            cycle,
                            EndReason::Stop,
                            Utc::now(),
                            None,
                            None,
                        )
                        .context("record stopped cycle")?;
                    events.push(OrchestratorEvent::CycleEnded {
                        cycle,
                        status: CycleStatus::EndedByStop,
                    });
                }
                self.phase = Phase::Idle;
                self.deregister();
                info!(cycle, "stopped before the worker started");
                events.push(OrchestratorEvent::Stopped);
                Ok(events)
            }
            Phase::Running { cycle } | Phase::AwaitingStallConfirmation { cycle, .. } => {
                self.end_cycle(cycle, EndReason::Stop, None, None)
            }
            Phase::Terminating { cycle, reason } => self.finish_cycle(cycle, reason),
        }
    }

    fn plan_id(&self) -> Result<String> {
        self.state
            .plan_id
            .clone()
            .ok_or_else(|| anyhow!("no plan to resume (start a fresh plan)"))
    }

    /// Remove channel sockets, evidence and decisions left by a dead run.
    fn clear_leftovers(&self) {
        match sweep_stale_channels(&self.paths.channels_dir) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "removed stale channels"),
            Err(err) => warn!("failed to sweep stale channels: {err:#}"),
        }
        self.clear_pending_stall();
    }

    /// Withdraw the published evidence and any decision written against it.
    fn clear_pending_stall(&self) {
        if let Err(err) = clear_evidence(&self.paths.stall_evidence_path) {
            warn!("failed to clear stall evidence: {err:#}");
        }
        if let Err(err) = clear_decision(&self.paths.stall_decision_path) {
            warn!("failed to clear stall decision: {err:#}");
        }
    }

    fn terminate_recorded_worker(&mut self) -> Result<Option<u32>> {
        let Some(record) = self.state.worker.clone() else {
            return Ok(None);
        };
        if !self.launcher.probe(&record) {
            return Ok(None);
        }
        warn!(pid = record.pid, "terminating worker of the superseded plan");
        self.launcher
            .adopt(&record)
            .terminate()
            .context("terminate worker of superseded plan")?;
        Ok(Some(record.pid))
    }

    fn adopt(&mut self, cycle: u32, record: &WorkerRecord, now: Instant) -> Result<()> {
        let plan_id = self.plan_id()?;
        let channel_path = self.paths.channel_path(&plan_id, cycle);
        let channel = MessageChannel::bind(&channel_path).map_err(|err| SpawnFailed::Channel {
            path: channel_path.clone(),
            reason: format!("{err:#}"),
        })?;
        self.channel = Some(channel);
        self.worker = Some(self.launcher.adopt(record));
        self.watchdog = Some(Watchdog::new(self.config.stall_timeout, now));
        self.token_warned = false;
        self.phase = Phase::Running { cycle };
        info!(cycle, pid = record.pid, "reattached to running worker");
        Ok(())
    }

    fn spawn_cycle(&mut self, cycle: u32, now: Instant) -> Result<Events> {
        self.phase = Phase::Spawning { cycle };
        match self.launch(cycle, now) {
            Ok(pid) => Ok(vec![OrchestratorEvent::CycleStarted { cycle, pid }]),
            Err(err) => {
                self.channel = None;
                self.phase = Phase::Idle;
                self.deregister();
                error!(cycle, "cycle failed to start: {err:#}");
                Err(err.context(format!("start cycle {cycle}")))
            }
        }
    }

    #[instrument(skip(self, now))]
    fn launch(&mut self, cycle: u32, now: Instant) -> Result<u32> {
        let plan_id = self.plan_id()?;
        // Tear down any previous endpoint before creating the next one.
        self.channel = None;
        let channel_path = self.paths.channel_path(&plan_id, cycle);
        let channel = MessageChannel::bind(&channel_path).map_err(|err| SpawnFailed::Channel {
            path: channel_path.clone(),
            reason: format!("{err:#}"),
        })?;

        let cycle_paths = CyclePaths::new(&self.paths, &plan_id, cycle);
        let instructions = render_startup(
            &StartupInputs {
                plan_id: plan_id.clone(),
                cycle,
                channel_path: channel_path.clone(),
                state_path: self.paths.state_path.clone(),
                plan_path: self.paths.plan_path.clone(),
                token_threshold_percent: self.config.token_threshold_percent,
                stall_timeout_secs: self.config.stall_timeout.as_secs(),
                history_tail: self.config.history_tail,
            },
            &self.state,
        )
        .and_then(|text| write_instructions(&cycle_paths, &text).map(|()| text))
        .map_err(|err| SpawnFailed::Prepare(format!("{err:#}")))?;

        let request = SpawnRequest {
            plan_id,
            cycle,
            directory: self.config.worker_directory.clone(),
            instructions,
            instructions_path: cycle_paths.instructions_path,
            channel_path,
            state_path: self.paths.state_path.clone(),
            log_path: cycle_paths.log_path,
        };
        let mut worker = self.launcher.spawn(&request)?;
        let pid = worker.pid();

        if let Err(err) = self
            .store
            .record_cycle_start(&mut self.state, cycle, worker.record())
        {
            // An unrecorded live worker must not survive.
            if let Err(term) = worker.terminate() {
                error!(pid, "failed to terminate unrecorded worker: {term:#}");
            }
            return Err(err.context(format!("record start of cycle {cycle}")));
        }

        self.channel = Some(channel);
        self.worker = Some(worker);
        self.watchdog = Some(Watchdog::new(self.config.stall_timeout, now));
        self.token_warned = false;
        self.phase = Phase::Running { cycle };
        info!(cycle, pid, "cycle started");
        Ok(pid)
    }

    fn watchdog_expired(&self, now: Instant) -> bool {
        self.watchdog
            .as_ref()
            .is_some_and(|watchdog| watchdog.expired(now))
    }

    /// Move to `AwaitingStallConfirmation`. Terminates nothing.
    fn raise_stall(&mut self, cycle: u32, now: Instant) -> OrchestratorEvent {
        let worker_alive = self.worker.as_mut().is_some_and(|worker| worker.is_alive());
        let (elapsed_secs, timeout_secs) = self.watchdog.as_ref().map_or((0, 0), |watchdog| {
            (
                watchdog.elapsed(now).as_secs(),
                watchdog.timeout().as_secs(),
            )
        });
        let evidence = StallEvidence {
            plan_id: self.state.plan_id.clone(),
            cycle,
            worker_pid: self.worker_pid(),
            worker_alive,
            last_message: self.state.last_message.clone(),
            elapsed_secs,
            timeout_secs,
            detected_at: Utc::now(),
        };
        if let Err(err) = write_evidence(&self.paths.stall_evidence_path, &evidence) {
            warn!("failed to publish stall evidence: {err:#}");
        }
        warn!(
            cycle,
            elapsed_secs,
            worker_alive,
            "no worker message within the stall timeout; awaiting confirmation"
        );
        self.phase = Phase::AwaitingStallConfirmation {
            cycle,
            evidence: evidence.clone(),
        };
        OrchestratorEvent::StallDetected(evidence)
    }

    /// Apply queued records in arrival order.
    ///
    /// A record whose persistence fails stays at the head of the queue and is
    /// retried on the next tick.
    fn process_inbox(&mut self, cycle: u32, now: Instant) -> Result<Events> {
        if let Some(channel) = &self.channel {
            self.inbox.extend(channel.drain());
        }
        let mut events = Vec::new();
        while let Some(received) = self.inbox.pop_front() {
            let live = matches!(
                self.phase,
                Phase::Running { cycle: current } | Phase::AwaitingStallConfirmation { cycle: current, .. }
                    if current == cycle
            );
            if !live {
                debug!(cycle, "discarding message received after the cycle ended");
                continue;
            }
            match self.handle_message(cycle, received.clone(), now) {
                Ok(more) => events.extend(more),
                Err(err) => {
                    self.inbox.push_front(received);
                    return Err(err);
                }
            }
        }
        Ok(events)
    }

    fn handle_message(&mut self, cycle: u32, received: Received, now: Instant) -> Result<Events> {
        let message = match received.message {
            Ok(message) if message.kind().is_some() => message,
            Ok(_) => {
                let error = MalformedMessage::new("unknown message kind", "");
                warn!(cycle, "discarding message: {error}");
                return Ok(vec![OrchestratorEvent::MalformedMessage { cycle, error }]);
            }
            Err(error) => {
                warn!(cycle, "discarding message: {error}");
                return Ok(vec![OrchestratorEvent::MalformedMessage { cycle, error }]);
            }
        };

        let mut events = Vec::new();
        let tokens = message.tokens_used_percent();
        if let Some(percent) = tokens
            && percent >= self.config.token_threshold_percent
            && !self.token_warned
        {
            self.token_warned = true;
            warn!(
                cycle,
                percent,
                threshold = self.config.token_threshold_percent,
                "worker reached the token threshold"
            );
            events.push(OrchestratorEvent::TokenThresholdReached { cycle, percent });
        }

        let summary = message.summary();
        let last = |kind: MessageKind| LastMessage {
            kind,
            summary: summary.clone(),
            received_at: received.received_at,
        };
        match message {
            WorkerMessage::StatusUpdate { .. } => {
                self.store
                    .record_message(&mut self.state, last(MessageKind::StatusUpdate), tokens)
                    .context("record status update")?;
                events.push(OrchestratorEvent::StatusReceived {
                    cycle,
                    summary: summary.clone(),
                });
                self.note_liveness(cycle, now, &mut events);
            }
            WorkerMessage::StepComplete {
                step, description, ..
            } => {
                let current_step = self.state.current_step;
                let step = step.unwrap_or(current_step + 1);
                if step <= current_step {
                    self.store
                        .record_message(&mut self.state, last(MessageKind::StepComplete), tokens)
                        .context("record stale step")?;
                    warn!(cycle, step, current_step, "step already recorded; not appended");
                    events.push(OrchestratorEvent::StaleStepIgnored {
                        cycle,
                        step,
                        current_step,
                    });
                } else {
                    let task = description.unwrap_or_else(|| format!("step {step}"));
                    let record = StepRecord {
                        cycle,
                        step,
                        task: task.clone(),
                        tokens_used_percent: tokens,
                        completed_at: received.received_at,
                    };
                    self.store
                        .record_step(&mut self.state, record, summary.clone())
                        .context("record step")?;
                    info!(cycle, step, "step recorded");
                    events.push(OrchestratorEvent::StepRecorded { cycle, step, task });
                }
                self.note_liveness(cycle, now, &mut events);
            }
            WorkerMessage::EndOfCycle { .. } => {
                self.reset_watchdog(now);
                events.extend(self.end_cycle(
                    cycle,
                    EndReason::Normal,
                    Some(last(MessageKind::EndOfCycle)),
                    tokens,
                )?);
            }
            WorkerMessage::PlanComplete { .. } => {
                self.reset_watchdog(now);
                events.extend(self.end_cycle(
                    cycle,
                    EndReason::PlanComplete,
                    Some(last(MessageKind::PlanComplete)),
                    tokens,
                )?);
            }
            WorkerMessage::Unknown => {}
        }
        Ok(events)
    }

    fn reset_watchdog(&mut self, now: Instant) {
        if let Some(watchdog) = self.watchdog.as_mut() {
            watchdog.reset(now);
        }
    }

    /// A well-formed message is liveness evidence: reset the watchdog and,
    /// if a stall was pending, resolve it as an implicit extend.
    fn note_liveness(&mut self, cycle: u32, now: Instant, events: &mut Events) {
        self.reset_watchdog(now);
        if matches!(self.phase, Phase::AwaitingStallConfirmation { .. }) {
            info!(cycle, "worker reported while a stall was pending; stall cleared");
            self.phase = Phase::Running { cycle };
            self.clear_pending_stall();
            events.push(OrchestratorEvent::StallCleared { cycle });
        }
    }

    /// Persist the end of `cycle`, then tear it down.
    fn end_cycle(
        &mut self,
        cycle: u32,
        reason: EndReason,
        message: Option<LastMessage>,
        tokens: Option<f64>,
    ) -> Result<Events> {
        self.store
            .record_cycle_end(&mut self.state, cycle, reason, Utc::now(), message, tokens)
            .with_context(|| format!("record end of cycle {cycle}"))?;
        self.phase = Phase::Terminating { cycle, reason };
        self.finish_cycle(cycle, reason)
    }

    /// Terminate the worker, drop the channel and pick the next phase.
    ///
    /// The cycle end is already persisted. Safe to call again after a failed
    /// termination.
    fn finish_cycle(&mut self, cycle: u32, reason: EndReason) -> Result<Events> {
        if let Some(worker) = self.worker.as_mut() {
            worker
                .terminate()
                .with_context(|| format!("terminate worker of cycle {cycle}"))?;
        }
        self.worker = None;
        self.channel = None;
        if !self.inbox.is_empty() {
            debug!(
                cycle,
                dropped = self.inbox.len(),
                "dropping messages queued after cycle end"
            );
            self.inbox.clear();
        }
        self.clear_pending_stall();
        self.write_meta(cycle);

        let status = reason.status();
        info!(cycle, status = status.as_str(), "cycle ended");
        let mut events = vec![OrchestratorEvent::CycleEnded { cycle, status }];
        match reason {
            EndReason::Normal | EndReason::Stall if !self.stop_requested => {
                self.phase = Phase::Spawning { cycle: cycle + 1 };
            }
            EndReason::PlanComplete => {
                self.phase = Phase::PlanComplete;
                self.deregister();
                info!(cycle, "plan complete");
                events.push(OrchestratorEvent::PlanComplete { cycle });
            }
            EndReason::Normal | EndReason::Stall | EndReason::Stop => {
                self.phase = Phase::Idle;
                self.deregister();
                events.push(OrchestratorEvent::Stopped);
            }
        }
        Ok(events)
    }

    fn write_meta(&self, cycle: u32) {
        let Some(plan_id) = self.state.plan_id.as_deref() else {
            return;
        };
        let meta = CycleMeta::from_state(&self.state, plan_id, cycle, Utc::now());
        let cycle_paths = CyclePaths::new(&self.paths, plan_id, cycle);
        if let Err(err) = write_cycle_meta(&cycle_paths, &meta) {
            warn!(cycle, "failed to write cycle meta: {err:#}");
        }
    }

    fn register(&mut self) {
        if self.registered {
            return;
        }
        match self.registry.register(&self.config.registry_name) {
            Ok(()) => {
                self.registered = true;
                self.last_heartbeat = None;
            }
            Err(err) => warn!("service registry register failed: {err:#}"),
        }
    }

    fn heartbeat(&mut self, now: Instant) {
        if !self.registered {
            return;
        }
        let due = self.last_heartbeat.is_none_or(|last| {
            now.saturating_duration_since(last) >= self.config.heartbeat_interval
        });
        if !due {
            return;
        }
        if let Err(err) = self.registry.heartbeat() {
            warn!("service registry heartbeat failed: {err:#}");
        }
        self.last_heartbeat = Some(now);
    }

    fn deregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        if let Err(err) = self.registry.deregister(&self.config.registry_name) {
            warn!("service registry deregister failed: {err:#}");
        }
    }
}
