//! Worker process handles and the launcher abstraction.
//!
//! [`WorkerLauncher`] decouples the orchestrator from how workers are
//! created. [`CommandLauncher`] runs the configured command in its own process
//! group; tests substitute scripted launchers that never fork.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::types::WorkerRecord;
use crate::errors::SpawnFailed;
use crate::io::process::{Signal, group_alive, pid_alive, process_started_at, signal_group};

const TERMINATE_POLL: Duration = Duration::from_millis(50);
/// `ps` reports whole seconds and the record is stamped just after spawn.
const START_TIME_SLACK_SECS: i64 = 2;

/// Everything needed to start one cycle's worker.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub plan_id: String,
    pub cycle: u32,
    /// Directory the worker operates in. Must exist.
    pub directory: PathBuf,
    /// Rendered startup instructions.
    pub instructions: String,
    /// Where the instructions were written.
    pub instructions_path: PathBuf,
    /// Channel endpoint for this cycle.
    pub channel_path: PathBuf,
    /// Persisted state file the worker may read for history.
    pub state_path: PathBuf,
    /// Destination for worker stdout/stderr.
    pub log_path: PathBuf,
}

/// A live (or formerly live) worker process.
pub trait WorkerProcess {
    fn pid(&self) -> u32;
    fn started_at(&self) -> DateTime<Utc>;
    fn directory(&self) -> &Path;

    /// Best-effort liveness; never fails.
    fn is_alive(&mut self) -> bool;

    /// Stop the worker and everything it started. Idempotent.
    fn terminate(&mut self) -> Result<()>;

    fn record(&self) -> WorkerRecord {
        WorkerRecord {
            pid: self.pid(),
            started_at: self.started_at(),
            directory: self.directory().to_path_buf(),
        }
    }
}

/// Creates and reattaches to worker processes.
pub trait WorkerLauncher {
    type Worker: WorkerProcess;

    fn spawn(&self, request: &SpawnRequest) -> Result<Self::Worker, SpawnFailed>;

    /// Wrap a worker recorded by an earlier supervisor run.
    fn adopt(&self, record: &WorkerRecord) -> Self::Worker;

    /// Liveness probe for a recorded worker that has not been adopted.
    fn probe(&self, record: &WorkerRecord) -> bool;
}

/// Launches the configured worker command.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: Vec<String>,
    stdin_instructions: bool,
    terminate_grace: Duration,
}

impl CommandLauncher {
    pub fn new(command: Vec<String>, stdin_instructions: bool, terminate_grace: Duration) -> Self {
        Self {
            command,
            stdin_instructions,
            terminate_grace,
        }
    }
}

impl WorkerLauncher for CommandLauncher {
    type Worker = ProcessWorker;

    #[instrument(skip_all, fields(cycle = request.cycle, plan = %request.plan_id))]
    fn spawn(&self, request: &SpawnRequest) -> Result<ProcessWorker, SpawnFailed> {
        if !request.directory.is_dir() {
            return Err(SpawnFailed::MissingDirectory(request.directory.clone()));
        }
        let argv = expand_command(&self.command, request);
        let (program, args) = argv.split_first().ok_or(SpawnFailed::EmptyCommand)?;
        if program.trim().is_empty() {
            return Err(SpawnFailed::EmptyCommand);
        }

        let log = open_log(&request.log_path)?;
        let log_err = log.try_clone().map_err(|source| SpawnFailed::Log {
            path: request.log_path.clone(),
            source,
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.directory)
            .env("CYCLER_CHANNEL", &request.channel_path)
            .env("CYCLER_CYCLE", request.cycle.to_string())
            .env("CYCLER_PLAN_ID", &request.plan_id)
            .env("CYCLER_INSTRUCTIONS_FILE", &request.instructions_path)
            .env("CYCLER_STATE_FILE", &request.state_path)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .stdin(if self.stdin_instructions {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        // Own process group, so termination reaches every descendant.
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SpawnFailed::Launch {
            program: program.clone(),
            source,
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            let instructions = request.instructions.clone();
            thread::spawn(move || {
                if let Err(err) = stdin.write_all(instructions.as_bytes()) {
                    warn!("failed to pipe instructions to worker: {err}");
                }
            });
        }

        let pid = child.id();
        info!(pid, directory = %request.directory.display(), "worker spawned");
        Ok(ProcessWorker {
            pid,
            started_at: Utc::now(),
            directory: request.directory.clone(),
            child: Some(child),
            terminate_grace: self.terminate_grace,
            terminated: false,
        })
    }

    fn adopt(&self, record: &WorkerRecord) -> ProcessWorker {
        info!(pid = record.pid, "adopting worker from previous run");
        ProcessWorker {
            pid: record.pid,
            started_at: record.started_at,
            directory: record.directory.clone(),
            child: None,
            terminate_grace: self.terminate_grace,
            terminated: false,
        }
    }

    fn probe(&self, record: &WorkerRecord) -> bool {
        if !pid_alive(record.pid) {
            return false;
        }
        let Some(started) = process_started_at(record.pid, Utc::now()) else {
            debug!(pid = record.pid, "start time unavailable, trusting pid liveness");
            return true;
        };
        if started > record.started_at + TimeDelta::seconds(START_TIME_SLACK_SECS) {
            warn!(
                pid = record.pid,
                recorded = %record.started_at,
                actual = %started,
                "pid belongs to a process started after the recorded worker, ignoring it"
            );
            return false;
        }
        true
    }
}

fn open_log(path: &Path) -> Result<File, SpawnFailed> {
    let as_log_error = |source| SpawnFailed::Log {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(as_log_error)?;
    }
    File::create(path).map_err(as_log_error)
}

fn expand_command(template: &[String], request: &SpawnRequest) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace(
                "{instructions_file}",
                &request.instructions_path.to_string_lossy(),
            )
            .replace("{channel}", &request.channel_path.to_string_lossy())
            .replace("{cycle}", &request.cycle.to_string())
            .replace("{directory}", &request.directory.to_string_lossy())
        })
        .collect()
}

/// OS process leading its own process group.
#[derive(Debug)]
pub struct ProcessWorker {
    pid: u32,
    started_at: DateTime<Utc>,
    directory: PathBuf,
    /// `None` for adopted workers, which are not our children.
    child: Option<Child>,
    terminate_grace: Duration,
    terminated: bool,
}

impl ProcessWorker {
    fn reap(&mut self) {
        if let Some(child) = self.child.as_mut()
            && let Err(err) = child.try_wait()
        {
            debug!(pid = self.pid, "try_wait failed: {err}");
        }
    }
}

impl WorkerProcess for ProcessWorker {
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
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(Some(_))) => false,
            Some(Ok(None)) => true,
            Some(Err(_)) | None => pid_alive(self.pid),
        }
    }

    /// SIGTERM the group, wait up to the grace period, then SIGKILL.
    #[instrument(skip_all, fields(pid = self.pid))]
    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.reap();
        if !group_alive(self.pid) {
            debug!("worker already gone");
            self.terminated = true;
            return Ok(());
        }

        signal_group(self.pid, Signal::Term)?;
        let deadline = Instant::now() + self.terminate_grace;
        loop {
            self.reap();
            if !group_alive(self.pid) {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    grace_secs = self.terminate_grace.as_secs(),
                    "worker ignored SIGTERM, sending SIGKILL"
                );
                signal_group(self.pid, Signal::Kill)?;
                if let Some(child) = self.child.as_mut() {
                    if let Err(err) = child.wait() {
                        debug!(pid = self.pid, "wait after SIGKILL failed: {err}");
                    }
                }
                break;
            }
            thread::sleep(TERMINATE_POLL);
        }
        info!("worker terminated");
        self.terminated = true;
        Ok(())
    }
}
