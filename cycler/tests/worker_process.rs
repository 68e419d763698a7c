//! Real-process tests for `CommandLauncher` termination and adoption.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};

use cycler::core::types::{EndReason, OrchestrationState, WorkerRecord};
use cycler::io::process::{group_alive, pid_alive};
use cycler::io::worker::{CommandLauncher, SpawnRequest, WorkerLauncher, WorkerProcess};
use cycler::orchestrator::{Orchestrator, OrchestratorEvent, StartMode};
use cycler::test_support::{ManualArbiter, TestProject};

fn request(dir: &Path) -> SpawnRequest {
    SpawnRequest {
        plan_id: "plan-proc".to_string(),
        cycle: 1,
        directory: dir.to_path_buf(),
        instructions: "work".to_string(),
        instructions_path: dir.join("instructions.md"),
        channel_path: dir.join("c1.sock"),
        state_path: dir.join("state.json"),
        log_path: dir.join("logs").join("worker.log"),
    }
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// A process-group leader that is not ours, recorded as if it were an old worker.
fn unrelated_process(record_age: TimeDelta, dir: &Path) -> (Child, WorkerRecord) {
    let child = Command::new("sleep")
        .arg("30")
        .process_group(0)
        .spawn()
        .expect("spawn unrelated process");
    let record = WorkerRecord {
        pid: child.id(),
        started_at: Utc::now() - record_age,
        directory: dir.to_path_buf(),
    };
    (child, record)
}

fn reap(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn terminate_stops_worker_and_its_children() {
    let temp = tempfile::tempdir().expect("tempdir");
    let launcher = CommandLauncher::new(sh("sleep 30 & sleep 30"), false, Duration::from_secs(5));
    let mut worker = launcher.spawn(&request(temp.path())).expect("spawn");
    let pid = worker.pid();
    assert!(worker.is_alive());

    let started = Instant::now();
    worker.terminate().expect("terminate");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!worker.is_alive());
    assert!(!group_alive(pid));

    // Idempotent.
    worker.terminate().expect("terminate again");
}

/// A worker ignoring SIGTERM is killed once the grace period runs out.
#[test]
fn terminate_escalates_to_kill_after_grace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let launcher = CommandLauncher::new(
        sh("trap '' TERM; sleep 30"),
        false,
        Duration::from_millis(300),
    );
    let mut worker = launcher.spawn(&request(temp.path())).expect("spawn");
    let pid = worker.pid();
    // Let the shell install its trap.
    thread::sleep(Duration::from_millis(100));

    worker.terminate().expect("terminate");
    assert!(!group_alive(pid));
}

#[test]
fn adopted_worker_is_recognized_and_terminated_by_pid() {
    let temp = tempfile::tempdir().expect("tempdir");
    // The adopted handle cannot reap, so the zombie keeps the group visible
    // until the grace period ends.
    let launcher = CommandLauncher::new(sh("sleep 30"), false, Duration::from_millis(500));
    let mut original = launcher.spawn(&request(temp.path())).expect("spawn");
    let record = original.record();
    assert!(launcher.probe(&record));

    let mut adopted = launcher.adopt(&record);
    assert_eq!(adopted.pid(), record.pid);
    adopted.terminate().expect("terminate adopted");

    // Reap through the original handle, which still owns the child.
    let deadline = Instant::now() + Duration::from_secs(5);
    while original.is_alive() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(!original.is_alive());
    assert!(!launcher.probe(&record));
}

#[test]
fn worker_output_goes_to_cycle_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let launcher = CommandLauncher::new(
        sh("echo out-line; echo err-line >&2"),
        false,
        Duration::from_secs(1),
    );
    let request = request(temp.path());
    let mut worker = launcher.spawn(&request).expect("spawn");

    let deadline = Instant::now() + Duration::from_secs(5);
    while worker.is_alive() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    let log = std::fs::read_to_string(&request.log_path).expect("log");
    assert!(log.contains("out-line"));
    assert!(log.contains("err-line"));
}

/// A recorded pid now held by a process that started after the record is not
/// treated as the recorded worker.
#[test]
fn reused_pid_is_not_mistaken_for_recorded_worker() {
    let temp = tempfile::tempdir().expect("tempdir");
    let launcher = CommandLauncher::new(sh("sleep 30"), false, Duration::from_secs(1));
    let (child, record) = unrelated_process(TimeDelta::hours(1), temp.path());

    assert!(pid_alive(record.pid));
    assert!(!launcher.probe(&record));

    reap(child);
}

#[test]
fn resume_leaves_process_holding_reused_pid_alone() {
    let project = TestProject::new().expect("project");
    let (mut child, record) = unrelated_process(TimeDelta::hours(1), project.root());
    let pid = record.pid;

    let store = project.store();
    let mut state = OrchestrationState::for_plan("plan-reused-pid");
    store.save(&mut state).expect("save");
    store.record_cycle_start(&mut state, 2, record).expect("cycle start");
    store
        .record_cycle_end(&mut state, 2, EndReason::Normal, Utc::now(), None, None)
        .expect("cycle end");

    let launcher = CommandLauncher::new(sh("sleep 30"), false, Duration::from_secs(1));
    let mut orchestrator = Orchestrator::new(
        project.paths().clone(),
        project.config(),
        launcher,
        ManualArbiter::new(),
    );
    let events = orchestrator
        .start(StartMode::Resume, Instant::now())
        .expect("resume");

    assert!(
        !events
            .iter()
            .any(|event| matches!(event, OrchestratorEvent::OrphanTerminated { .. }))
    );
    assert!(matches!(
        events.first(),
        Some(OrchestratorEvent::CycleStarted { cycle: 3, .. })
    ));
    assert!(child.try_wait().expect("try_wait").is_none());
    assert!(pid_alive(pid));

    orchestrator.stop().expect("stop");
    reap(child);
}
