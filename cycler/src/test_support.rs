//! Test-only doubles for driving the orchestrator without real workers.
//!
//! [`ScriptedLauncher`] never forks: each spawn hands out a [`FakeWorker`]
//! with a made-up pid and immediately delivers that worker's scripted records
//! over the real per-cycle channel.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::core::message::WorkerMessage;
use crate::core::phase::{StallDecision, StallEvidence};
use crate::core::types::{OrchestrationState, WorkerRecord};
use crate::errors::SpawnFailed;
use crate::io::channel::ChannelSender;
use crate::io::control::{FileArbiter, StallArbiter};
use crate::io::init::{CyclerPaths, InitOptions, init_cycler};
use crate::io::state_store::StateStore;
use crate::io::worker::{SpawnRequest, WorkerLauncher, WorkerProcess};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};

const FIRST_FAKE_PID: u32 = 40_000;

/// An initialized project in a temp directory.
pub struct TestProject {
    temp: TempDir,
    paths: CyclerPaths,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = init_cycler(temp.path(), &InitOptions { force: false })?;
        Ok(Self { temp, paths })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &CyclerPaths {
        &self.paths
    }

    /// Config with a generous stall timeout; tests pass explicit instants.
    pub fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            stall_timeout: Duration::from_secs(60),
            token_threshold_percent: 80.0,
            worker_directory: self.root().to_path_buf(),
            history_tail: 10,
            registry_name: "cycler-test".to_string(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.paths.state_path)
    }

    /// Read the persisted state, panicking on corruption.
    pub fn load_state(&self) -> OrchestrationState {
        self.store()
            .load_checked()
            .expect("state is valid")
            .unwrap_or_default()
    }

    pub fn orchestrator(
        &self,
        launcher: ScriptedLauncher,
        arbiter: ManualArbiter,
    ) -> Orchestrator<ScriptedLauncher, ManualArbiter> {
        Orchestrator::new(self.paths.clone(), self.config(), launcher, arbiter)
    }

    /// Orchestrator answered by `cycler decide` files, as in production.
    pub fn file_orchestrator(
        &self,
        launcher: ScriptedLauncher,
    ) -> Orchestrator<ScriptedLauncher, FileArbiter> {
        let arbiter = FileArbiter::new(&self.paths.stall_decision_path);
        Orchestrator::new(self.paths.clone(), self.config(), launcher, arbiter)
    }

    /// Send one message to `plan`'s channel for `cycle`, as a worker would.
    pub fn send(&self, plan_id: &str, cycle: u32, message: &WorkerMessage) {
        ChannelSender::new(self.paths.channel_path(plan_id, cycle))
            .send(message)
            .expect("channel is bound");
    }

    pub fn send_raw(&self, plan_id: &str, cycle: u32, record: &str) {
        ChannelSender::new(self.paths.channel_path(plan_id, cycle))
            .send_raw(record)
            .expect("channel is bound");
    }
}

/// One record a scripted worker sends right after it is spawned.
#[derive(Debug, Clone)]
pub enum ScriptedRecord {
    Message(WorkerMessage),
    Raw(String),
}

impl From<WorkerMessage> for ScriptedRecord {
    fn from(message: WorkerMessage) -> Self {
        ScriptedRecord::Message(message)
    }
}

/// What the next spawn does.
#[derive(Debug, Clone)]
pub enum ScriptedSpawn {
    Send(Vec<ScriptedRecord>),
    Fail(String),
}

impl ScriptedSpawn {
    pub fn messages(messages: impl IntoIterator<Item = WorkerMessage>) -> Self {
        ScriptedSpawn::Send(messages.into_iter().map(ScriptedRecord::from).collect())
    }

    /// A worker that never reports anything.
    pub fn silent() -> Self {
        ScriptedSpawn::Send(Vec::new())
    }
}

#[derive(Debug, Default)]
struct FakeProcesses {
    next_pid: u32,
    alive: BTreeMap<u32, bool>,
    terminated: Vec<u32>,
    spawned: Vec<SpawnRequest>,
    script: VecDeque<ScriptedSpawn>,
}

impl FakeProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.get(&pid).copied().unwrap_or(false)
    }
}

/// Launcher double. Clones share the same fake process table, so a test can
/// keep a handle while the orchestrator owns another.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLauncher {
    processes: Rc<RefCell<FakeProcesses>>,
}

impl ScriptedLauncher {
    pub fn new(script: impl IntoIterator<Item = ScriptedSpawn>) -> Self {
        let processes = FakeProcesses {
            next_pid: FIRST_FAKE_PID,
            script: script.into_iter().collect(),
            ..FakeProcesses::default()
        };
        Self {
            processes: Rc::new(RefCell::new(processes)),
        }
    }

    /// Queue behaviour for a later spawn.
    pub fn push(&self, spawn: ScriptedSpawn) {
        self.processes.borrow_mut().script.push_back(spawn);
    }

    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.processes.borrow().spawned.clone()
    }

    pub fn spawned_cycles(&self) -> Vec<u32> {
        self.processes
            .borrow()
            .spawned
            .iter()
            .map(|request| request.cycle)
            .collect()
    }

    /// Pids in the order they were terminated.
    pub fn terminated(&self) -> Vec<u32> {
        self.processes.borrow().terminated.clone()
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.processes.borrow().is_alive(pid)
    }

    /// Simulate the worker exiting (or reappearing) on its own.
    pub fn set_alive(&self, pid: u32, alive: bool) {
        self.processes.borrow_mut().alive.insert(pid, alive);
    }

    fn worker(&self, pid: u32, started_at: DateTime<Utc>, directory: PathBuf) -> FakeWorker {
        FakeWorker {
            pid,
            started_at,
            directory,
            processes: Rc::clone(&self.processes),
        }
    }
}

impl WorkerLauncher for ScriptedLauncher {
    type Worker = FakeWorker;

    fn spawn(&self, request: &SpawnRequest) -> Result<FakeWorker, SpawnFailed> {
        if !request.directory.is_dir() {
            return Err(SpawnFailed::MissingDirectory(request.directory.clone()));
        }
        let (pid, records) = {
            let mut processes = self.processes.borrow_mut();
            let records = match processes.script.pop_front() {
                Some(ScriptedSpawn::Fail(reason)) => return Err(SpawnFailed::Rejected(reason)),
                Some(ScriptedSpawn::Send(records)) => records,
                None => Vec::new(),
            };
            let pid = processes.next_pid;
            processes.next_pid += 1;
            processes.alive.insert(pid, true);
            processes.spawned.push(request.clone());
            (pid, records)
        };

        let sender = ChannelSender::new(&request.channel_path);
        for record in records {
            let sent = match record {
                ScriptedRecord::Message(message) => sender.send(&message),
                ScriptedRecord::Raw(raw) => sender.send_raw(&raw),
            };
            sent.map_err(|err| SpawnFailed::Rejected(err.to_string()))?;
        }
        Ok(self.worker(pid, Utc::now(), request.directory.clone()))
    }

    fn adopt(&self, record: &WorkerRecord) -> FakeWorker {
        self.worker(record.pid, record.started_at, record.directory.clone())
    }

    fn probe(&self, record: &WorkerRecord) -> bool {
        self.is_alive(record.pid)
    }
}

/// Handle to a fake process in a [`ScriptedLauncher`]'s table.
#[derive(Debug)]
pub struct FakeWorker {
    pid: u32,
    started_at: DateTime<Utc>,
    directory: PathBuf,
    processes: Rc<RefCell<FakeProcesses>>,
}

impl WorkerProcess for FakeWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn directory(&self) -> &Path {
        &self.directory
    }

    fn is_alive(&mut self) -> bool {
        self.processes.borrow().is_alive(self.pid)
    }

    fn terminate(&mut self) -> Result<()> {
        let mut processes = self.processes.borrow_mut();
        if processes.is_alive(self.pid) {
            processes.alive.insert(self.pid, false);
            processes.terminated.push(self.pid);
        }
        Ok(())
    }
}

/// Arbiter double: answers stalls from a queue filled by the test.
#[derive(Debug, Clone, Default)]
pub struct ManualArbiter {
    decisions: Rc<RefCell<VecDeque<StallDecision>>>,
    consulted: Rc<RefCell<Vec<StallEvidence>>>,
}

impl ManualArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, decision: StallDecision) {
        self.decisions.borrow_mut().push_back(decision);
    }

    /// Evidence passed to every `decide` call so far.
    pub fn consulted(&self) -> Vec<StallEvidence> {
        self.consulted.borrow().clone()
    }
}

impl StallArbiter for ManualArbiter {
    fn decide(&self, evidence: &StallEvidence) -> Result<Option<StallDecision>> {
        self.consulted.borrow_mut().push(evidence.clone());
        Ok(self.decisions.borrow_mut().pop_front())
    }
}
