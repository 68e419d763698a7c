//! Orchestrator-level tests for full cycle lifecycle scenarios.
//!
//! These drive `Orchestrator::start`/`tick` with explicit instants against
//! scripted workers that report over the real per-cycle channel, and verify
//! cycle advancement, stall confirmation, resume and persistence.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Result;

use cycler::core::message::WorkerMessage;
use cycler::core::phase::{Phase, StallDecision};
use cycler::core::types::{CycleStatus, EndReason, WorkerRecord};
use cycler::errors::{NoStallPending, SpawnFailed};
use cycler::io::control::{read_evidence, submit_decision};
use cycler::io::cycle_log::{CyclePaths, read_cycle_meta};
use cycler::io::registry::ServiceRegistry;
use cycler::orchestrator::{Orchestrator, OrchestratorEvent, StartMode};
use cycler::test_support::{
    ManualArbiter, ScriptedLauncher, ScriptedRecord, ScriptedSpawn, TestProject,
};

type TestOrchestrator = Orchestrator<ScriptedLauncher, ManualArbiter>;

fn at(t0: Instant, secs: u64) -> Instant {
    t0 + Duration::from_secs(secs)
}

fn fresh(plan_id: &str) -> StartMode {
    StartMode::Fresh {
        plan_id: plan_id.to_string(),
    }
}

/// Tick once per simulated second until the orchestrator settles.
fn run_until_settled(orchestrator: &mut TestOrchestrator, t0: Instant) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    for second in 1..=50 {
        events.extend(orchestrator.tick(at(t0, second)).expect("tick"));
        if orchestrator.phase().is_settled() {
            return events;
        }
    }
    panic!("orchestrator did not settle: {:?}", orchestrator.phase());
}

/// Full plan: four cycles, each ended by the worker, the last with
/// `plan_complete`.
///
/// Cycle scripts:
/// 1. step 1, step 2, end_of_cycle
/// 2. step 3, end_of_cycle
/// 3. status_update, end_of_cycle
/// 4. step 4, plan_complete
///
/// Tests: strictly increasing cycle numbers, history accumulated across
/// cycles, one worker terminated per cycle, per-cycle meta, and startup
/// instructions pointing at the next step.
#[test]
fn four_cycle_plan_advances_monotonically_to_completion() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([
        ScriptedSpawn::messages([
            WorkerMessage::step(1, "one"),
            WorkerMessage::step(2, "two"),
            WorkerMessage::end_of_cycle(),
        ]),
        ScriptedSpawn::messages([WorkerMessage::step(3, "three"), WorkerMessage::end_of_cycle()]),
        ScriptedSpawn::messages([
            WorkerMessage::status("reading code"),
            WorkerMessage::end_of_cycle(),
        ]),
        ScriptedSpawn::messages([WorkerMessage::step(4, "four"), WorkerMessage::plan_complete()]),
    ]);
    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    let t0 = Instant::now();

    let started = orchestrator.start(fresh("plan-e2e"), t0).expect("start");
    assert!(matches!(
        started.as_slice(),
        [OrchestratorEvent::CycleStarted { cycle: 1, .. }]
    ));

    let events = run_until_settled(&mut orchestrator, t0);
    let ended: Vec<(u32, CycleStatus)> = events
        .iter()
        .filter_map(|event| match event {
            OrchestratorEvent::CycleEnded { cycle, status } => Some((*cycle, *status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        ended,
        vec![
            (1, CycleStatus::EndedNormally),
            (2, CycleStatus::EndedNormally),
            (3, CycleStatus::EndedNormally),
            (4, CycleStatus::EndedByPlanComplete),
        ]
    );
    assert_eq!(events.last(), Some(&OrchestratorEvent::PlanComplete { cycle: 4 }));
    assert_eq!(orchestrator.phase(), &Phase::PlanComplete);

    assert_eq!(launcher.spawned_cycles(), vec![1, 2, 3, 4]);
    assert_eq!(launcher.terminated().len(), 4);

    let state = project.load_state();
    assert_eq!(state.cycle_number, 4);
    assert_eq!(state.current_step, 4);
    assert_eq!(state.cycle_status, Some(CycleStatus::EndedByPlanComplete));
    let steps: Vec<(u32, u32)> = state
        .history
        .iter()
        .map(|record| (record.cycle, record.step))
        .collect();
    assert_eq!(steps, vec![(1, 1), (1, 2), (2, 3), (4, 4)]);
    let cycles: Vec<u32> = state.cycles.iter().map(|record| record.cycle).collect();
    assert_eq!(cycles, vec![1, 2, 3, 4]);

    let meta = read_cycle_meta(&CyclePaths::new(project.paths(), "plan-e2e", 2))
        .expect("read meta")
        .expect("meta written");
    assert_eq!(meta.status, CycleStatus::EndedNormally);
    assert_eq!(meta.steps, vec![3]);

    let requests = launcher.spawned();
    assert!(requests[3].instructions.contains("# Cycle 4 of plan `plan-e2e`"));
    assert!(requests[3].instructions.contains("next step number is **4**"));
    assert!(requests[1].channel_path.ends_with("plan-e2e-c2.sock"));
}

/// Four cycles of one step each: the counter moves 1 -> 4 one cycle at a
/// time and each cycle contributes exactly its own step.
#[test]
fn one_step_per_cycle_plan_runs_four_cycles() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([
        ScriptedSpawn::messages([WorkerMessage::step(1, "lexer"), WorkerMessage::end_of_cycle()]),
        ScriptedSpawn::messages([WorkerMessage::step(2, "parser"), WorkerMessage::end_of_cycle()]),
        ScriptedSpawn::messages([WorkerMessage::step(3, "checker"), WorkerMessage::end_of_cycle()]),
        ScriptedSpawn::messages([WorkerMessage::step(4, "codegen"), WorkerMessage::plan_complete()]),
    ]);
    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-steps"), t0).expect("start");

    let mut observed = vec![project.load_state().cycle_number];
    for second in 1..=20 {
        orchestrator.tick(at(t0, second)).expect("tick");
        let cycle = project.load_state().cycle_number;
        if observed.last() != Some(&cycle) {
            observed.push(cycle);
        }
        if orchestrator.phase().is_settled() {
            break;
        }
    }
    assert_eq!(observed, vec![1, 2, 3, 4]);
    assert_eq!(orchestrator.phase(), &Phase::PlanComplete);
    assert_eq!(orchestrator.worker_pid(), None);
    assert_eq!(launcher.terminated().len(), 4);

    let state = project.load_state();
    let steps: Vec<(u32, u32)> = state
        .history
        .iter()
        .map(|record| (record.cycle, record.step))
        .collect();
    assert_eq!(steps, vec![(1, 1), (2, 2), (3, 3), (4, 4)]);
    assert_eq!(state.current_step, 4);
    assert_eq!(state.cycle_status, Some(CycleStatus::EndedByPlanComplete));

    for (index, request) in launcher.spawned().iter().enumerate() {
        let next_step = index + 1;
        assert!(
            request
                .instructions
                .contains(&format!("next step number is **{next_step}**")),
            "cycle {next_step} instructions: {}",
            request.instructions
        );
    }
}

/// Regression: automatic transitions never reset the cycle counter.
#[test]
fn automatic_cycle_ends_only_ever_increment_by_one() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new(
        (0..6).map(|_| ScriptedSpawn::messages([WorkerMessage::end_of_cycle()])),
    );
    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-mono"), t0).expect("start");

    let mut last_cycle = project.load_state().cycle_number;
    for second in 1..=10 {
        orchestrator.tick(at(t0, second)).expect("tick");
        let cycle = project.load_state().cycle_number;
        assert!(
            cycle == last_cycle || cycle == last_cycle + 1,
            "cycle jumped from {last_cycle} to {cycle}"
        );
        last_cycle = cycle;
    }
    assert_eq!(launcher.spawned_cycles(), vec![1, 2, 3, 4, 5, 6]);
}

/// The watchdog only raises a stall; without a decision the worker keeps
/// running indefinitely.
#[test]
fn stall_never_terminates_without_confirmation() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::silent()]);
    let arbiter = ManualArbiter::new();
    let mut orchestrator = project.orchestrator(launcher.clone(), arbiter.clone());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-stall"), t0).expect("start");
    let pid = orchestrator.worker_pid().expect("worker");

    assert!(orchestrator.tick(at(t0, 59)).expect("tick").is_empty());

    let events = orchestrator.tick(at(t0, 60)).expect("tick");
    let [OrchestratorEvent::StallDetected(evidence)] = events.as_slice() else {
        panic!("expected stall, got {events:?}");
    };
    assert_eq!(evidence.cycle, 1);
    assert_eq!(evidence.worker_pid, Some(pid));
    assert!(evidence.worker_alive);
    assert_eq!(evidence.elapsed_secs, 60);
    assert!(matches!(
        orchestrator.phase(),
        Phase::AwaitingStallConfirmation { cycle: 1, .. }
    ));
    let published = read_evidence(&project.paths().stall_evidence_path)
        .expect("read evidence")
        .expect("evidence published");
    assert_eq!(published.cycle, 1);

    for second in [120, 600, 3600, 86_400] {
        assert!(orchestrator.tick(at(t0, second)).expect("tick").is_empty());
    }
    assert!(launcher.is_alive(pid));
    assert!(launcher.terminated().is_empty());
    assert_eq!(arbiter.consulted().len(), 4);
    assert_eq!(project.load_state().cycle_status, Some(CycleStatus::Running));
}

#[test]
fn extend_keeps_worker_and_pushes_deadline_forward() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::silent()]);
    let arbiter = ManualArbiter::new();
    let mut orchestrator = project.orchestrator(launcher.clone(), arbiter.clone());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-extend"), t0).expect("start");
    orchestrator.tick(at(t0, 60)).expect("stall");

    arbiter.push(StallDecision::Extend);
    let events = orchestrator.tick(at(t0, 120)).expect("tick");
    assert_eq!(
        events,
        vec![OrchestratorEvent::StallResolved {
            cycle: 1,
            decision: StallDecision::Extend
        }]
    );
    assert_eq!(orchestrator.phase(), &Phase::Running { cycle: 1 });
    assert!(!project.paths().stall_evidence_path.exists());
    assert!(launcher.terminated().is_empty());

    assert!(orchestrator.tick(at(t0, 179)).expect("tick").is_empty());
    let events = orchestrator.tick(at(t0, 180)).expect("tick");
    assert!(matches!(
        events.as_slice(),
        [OrchestratorEvent::StallDetected(_)]
    ));
}

/// Confirmed stall: cycle ends as `ended_by_stall` and the next cycle spawns.
#[test]
fn confirm_terminate_ends_cycle_by_stall_and_spawns_next() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([
        ScriptedSpawn::messages([WorkerMessage::step(1, "partial")]),
        ScriptedSpawn::silent(),
    ]);
    let arbiter = ManualArbiter::new();
    let mut orchestrator = project.orchestrator(launcher.clone(), arbiter.clone());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-term"), t0).expect("start");
    let first_pid = orchestrator.worker_pid().expect("worker");

    orchestrator.tick(at(t0, 1)).expect("step");
    orchestrator.tick(at(t0, 61)).expect("stall");
    arbiter.push(StallDecision::ConfirmTerminate);

    let events = orchestrator.tick(at(t0, 62)).expect("tick");
    assert!(events.contains(&OrchestratorEvent::CycleEnded {
        cycle: 1,
        status: CycleStatus::EndedByStall
    }));
    assert_eq!(orchestrator.phase(), &Phase::Spawning { cycle: 2 });
    assert_eq!(launcher.terminated(), vec![first_pid]);
    assert!(!project.paths().stall_evidence_path.exists());

    let events = orchestrator.tick(at(t0, 63)).expect("tick");
    assert!(matches!(
        events.as_slice(),
        [OrchestratorEvent::CycleStarted { cycle: 2, .. }]
    ));

    let state = project.load_state();
    assert_eq!(state.cycle_number, 2);
    assert_eq!(state.current_step, 1);
    assert_eq!(state.cycles[0].status, CycleStatus::EndedByStall);
    assert!(launcher.spawned()[1].instructions.contains("next step number is **2**"));
}

#[test]
fn disable_watchdog_suppresses_stalls_for_the_rest_of_the_cycle_only() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::silent(), ScriptedSpawn::silent()]);
    let arbiter = ManualArbiter::new();
    let mut orchestrator = project.orchestrator(launcher.clone(), arbiter.clone());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-off"), t0).expect("start");

    orchestrator.tick(at(t0, 60)).expect("stall");
    arbiter.push(StallDecision::DisableWatchdog);
    orchestrator.tick(at(t0, 61)).expect("disable");
    assert_eq!(orchestrator.phase(), &Phase::Running { cycle: 1 });
    assert!(orchestrator.tick(at(t0, 100_000)).expect("tick").is_empty());

    project.send("plan-off", 1, &WorkerMessage::end_of_cycle());
    orchestrator.tick(at(t0, 100_001)).expect("end");
    orchestrator.tick(at(t0, 100_002)).expect("spawn 2");
    assert_eq!(orchestrator.phase(), &Phase::Running { cycle: 2 });

    let events = orchestrator.tick(at(t0, 100_062)).expect("tick");
    assert!(matches!(
        events.as_slice(),
        [OrchestratorEvent::StallDetected(evidence)] if evidence.cycle == 2
    ));
}

/// A report that arrives while a stall is pending is applied, and clears the
/// stall without consulting the arbiter.
#[test]
fn late_report_while_awaiting_confirmation_clears_stall() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::silent()]);
    let arbiter = ManualArbiter::new();
    let mut orchestrator = project.orchestrator(launcher.clone(), arbiter.clone());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-late"), t0).expect("start");
    orchestrator.tick(at(t0, 60)).expect("stall");

    project.send("plan-late", 1, &WorkerMessage::step(1, "slow but done"));
    let events = orchestrator.tick(at(t0, 70)).expect("tick");
    assert_eq!(
        events,
        vec![
            OrchestratorEvent::StepRecorded {
                cycle: 1,
                step: 1,
                task: "slow but done".to_string()
            },
            OrchestratorEvent::StallCleared { cycle: 1 },
        ]
    );
    assert_eq!(orchestrator.phase(), &Phase::Running { cycle: 1 });
    assert!(arbiter.consulted().is_empty());
    assert!(!project.paths().stall_evidence_path.exists());
    assert_eq!(project.load_state().current_step, 1);

    assert!(orchestrator.tick(at(t0, 129)).expect("tick").is_empty());
}

/// `cycler decide extend` answers the pending stall through the decision file.
#[test]
fn decision_file_extends_pending_stall() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::silent()]);
    let mut orchestrator = project.file_orchestrator(launcher.clone());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-file"), t0).expect("start");
    let pid = orchestrator.worker_pid().expect("worker");

    orchestrator.tick(at(t0, 60)).expect("stall");
    assert!(orchestrator.tick(at(t0, 61)).expect("no decision yet").is_empty());

    submit_decision(project.paths(), StallDecision::Extend).expect("decide");
    let events = orchestrator.tick(at(t0, 62)).expect("tick");
    assert_eq!(
        events,
        vec![OrchestratorEvent::StallResolved {
            cycle: 1,
            decision: StallDecision::Extend
        }]
    );
    assert_eq!(orchestrator.phase(), &Phase::Running { cycle: 1 });
    assert!(launcher.is_alive(pid));
    assert!(!project.paths().stall_decision_path.exists());
    assert!(!project.paths().stall_evidence_path.exists());
}

/// Regression: a terminate decision overtaken by a late report must not
/// answer the next stall of the same cycle.
///
/// Sequence: stall 1, operator decides terminate, the worker reports before
/// the supervisor reads the decision, stall 2. Stall 2 waits for its own
/// decision and the worker is untouched until then.
#[test]
fn decision_overtaken_by_late_report_does_not_answer_next_stall() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::silent(), ScriptedSpawn::silent()]);
    let mut orchestrator = project.file_orchestrator(launcher.clone());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-race"), t0).expect("start");
    let pid = orchestrator.worker_pid().expect("worker");

    orchestrator.tick(at(t0, 61)).expect("stall 1");
    submit_decision(project.paths(), StallDecision::ConfirmTerminate).expect("decide");
    project.send("plan-race", 1, &WorkerMessage::status("still compiling"));

    let events = orchestrator.tick(at(t0, 62)).expect("tick");
    assert_eq!(
        events,
        vec![
            OrchestratorEvent::StatusReceived {
                cycle: 1,
                summary: "still compiling".to_string()
            },
            OrchestratorEvent::StallCleared { cycle: 1 },
        ]
    );
    assert_eq!(orchestrator.phase(), &Phase::Running { cycle: 1 });
    assert!(!project.paths().stall_decision_path.exists());

    let events = orchestrator.tick(at(t0, 200)).expect("stall 2");
    assert!(matches!(
        events.as_slice(),
        [OrchestratorEvent::StallDetected(evidence)] if evidence.cycle == 1
    ));
    for second in [201, 300, 1_000] {
        assert!(orchestrator.tick(at(t0, second)).expect("tick").is_empty());
    }
    assert!(matches!(
        orchestrator.phase(),
        Phase::AwaitingStallConfirmation { cycle: 1, .. }
    ));
    assert!(launcher.is_alive(pid));
    assert!(launcher.terminated().is_empty());
    assert_eq!(project.load_state().cycle_status, Some(CycleStatus::Running));

    submit_decision(project.paths(), StallDecision::ConfirmTerminate).expect("decide again");
    let events = orchestrator.tick(at(t0, 1_001)).expect("tick");
    assert!(events.contains(&OrchestratorEvent::CycleEnded {
        cycle: 1,
        status: CycleStatus::EndedByStall
    }));
    assert_eq!(launcher.terminated(), vec![pid]);
}

/// Malformed records are reported and dropped; they never count as liveness.
#[test]
fn malformed_records_are_discarded_without_resetting_watchdog() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::Send(vec![
        ScriptedRecord::Raw("not json at all".to_string()),
        ScriptedRecord::Raw(r#"{"kind":"bogus","text":"x"}"#.to_string()),
        ScriptedRecord::Message(WorkerMessage::step(1, "real work")),
    ])]);
    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-bad"), t0).expect("start");

    let events = orchestrator.tick(at(t0, 10)).expect("tick");
    let malformed = events
        .iter()
        .filter(|event| matches!(event, OrchestratorEvent::MalformedMessage { .. }))
        .count();
    assert_eq!(malformed, 2);
    assert!(matches!(
        events.last(),
        Some(OrchestratorEvent::StepRecorded { step: 1, .. })
    ));
    assert_eq!(project.load_state().current_step, 1);

    project.send_raw("plan-bad", 1, "{\"kind\":\"step_complete\",\"step\":0}");
    let events = orchestrator.tick(at(t0, 50)).expect("tick");
    assert!(matches!(
        events.as_slice(),
        [OrchestratorEvent::MalformedMessage { cycle: 1, .. }]
    ));

    let events = orchestrator.tick(at(t0, 70)).expect("tick");
    assert!(matches!(
        events.as_slice(),
        [OrchestratorEvent::StallDetected(_)]
    ));
}

#[test]
fn stale_step_is_not_appended_and_missing_number_is_assigned() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::messages([
        WorkerMessage::step(1, "first"),
        WorkerMessage::step(1, "first again"),
        WorkerMessage::StepComplete {
            step: None,
            description: Some("unnumbered".to_string()),
            tokens_used_percent: None,
        },
    ])]);
    let mut orchestrator = project.orchestrator(launcher, ManualArbiter::new());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-steps"), t0).expect("start");

    let events = orchestrator.tick(at(t0, 1)).expect("tick");
    assert_eq!(
        events,
        vec![
            OrchestratorEvent::StepRecorded {
                cycle: 1,
                step: 1,
                task: "first".to_string()
            },
            OrchestratorEvent::StaleStepIgnored {
                cycle: 1,
                step: 1,
                current_step: 1
            },
            OrchestratorEvent::StepRecorded {
                cycle: 1,
                step: 2,
                task: "unnumbered".to_string()
            },
        ]
    );
    let state = project.load_state();
    let steps: Vec<u32> = state.history.iter().map(|record| record.step).collect();
    assert_eq!(steps, vec![1, 2]);
}

/// Token usage is persisted and warned about once, never acted on.
#[test]
fn token_threshold_is_reported_once_per_cycle() {
    let project = TestProject::new().expect("project");
    let status = |percent| WorkerMessage::StatusUpdate {
        text: Some("busy".to_string()),
        tokens_used_percent: Some(percent),
    };
    let launcher = ScriptedLauncher::new([ScriptedSpawn::messages([
        status(40.0),
        status(85.0),
        status(91.0),
    ])]);
    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-tokens"), t0).expect("start");

    let events = orchestrator.tick(at(t0, 1)).expect("tick");
    let warnings: Vec<&OrchestratorEvent> = events
        .iter()
        .filter(|event| matches!(event, OrchestratorEvent::TokenThresholdReached { .. }))
        .collect();
    assert_eq!(
        warnings,
        vec![&OrchestratorEvent::TokenThresholdReached {
            cycle: 1,
            percent: 85.0
        }]
    );
    assert_eq!(project.load_state().tokens_used_percent, Some(91.0));
    assert_eq!(orchestrator.phase(), &Phase::Running { cycle: 1 });
    assert!(launcher.terminated().is_empty());
}

/// Every mutation is one save: the revision counter moves in lockstep.
#[test]
fn each_state_mutation_is_persisted_once() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::messages([
        WorkerMessage::status("warming up"),
        WorkerMessage::step(1, "one"),
        WorkerMessage::end_of_cycle(),
    ])]);
    let mut orchestrator = project.orchestrator(launcher, ManualArbiter::new());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-rev"), t0).expect("start");
    // Fresh plan save, then cycle start.
    assert_eq!(project.load_state().revision, 2);

    orchestrator.tick(at(t0, 1)).expect("tick");
    // Status, step, cycle end.
    assert_eq!(project.load_state().revision, 5);
    assert_eq!(orchestrator.state(), &project.load_state());

    orchestrator.tick(at(t0, 2)).expect("spawn");
    assert_eq!(project.load_state().revision, 6);
}

#[test]
fn resume_adopts_live_worker_without_respawning() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::messages([WorkerMessage::step(
        1, "before restart",
    )])]);
    let t0 = Instant::now();
    let pid = {
        let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
        orchestrator.start(fresh("plan-adopt"), t0).expect("start");
        orchestrator.tick(at(t0, 1)).expect("tick");
        orchestrator.worker_pid().expect("worker")
    };
    assert!(launcher.is_alive(pid));

    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    let events = orchestrator
        .start(StartMode::Resume, at(t0, 100))
        .expect("resume");
    assert_eq!(events, vec![OrchestratorEvent::WorkerAdopted { cycle: 1, pid }]);
    assert_eq!(launcher.spawned_cycles(), vec![1]);
    assert_eq!(orchestrator.worker_pid(), Some(pid));

    // The adopted worker keeps reporting on the same cycle's channel.
    project.send("plan-adopt", 1, &WorkerMessage::step(2, "after restart"));
    project.send("plan-adopt", 1, &WorkerMessage::end_of_cycle());
    let events = orchestrator.tick(at(t0, 101)).expect("tick");
    assert!(events.contains(&OrchestratorEvent::CycleEnded {
        cycle: 1,
        status: CycleStatus::EndedNormally
    }));
    assert_eq!(launcher.terminated(), vec![pid]);
    assert_eq!(project.load_state().current_step, 2);
}

/// Supervisor restart after its worker died mid-cycle: same cycle, new worker.
#[test]
fn resume_with_dead_worker_respawns_same_cycle() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([
        ScriptedSpawn::messages([WorkerMessage::step(1, "one")]),
        ScriptedSpawn::silent(),
    ]);
    let t0 = Instant::now();
    {
        let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
        orchestrator.start(fresh("plan-crash"), t0).expect("start");
        orchestrator.tick(at(t0, 1)).expect("tick");
        let pid = orchestrator.worker_pid().expect("worker");
        launcher.set_alive(pid, false);
    }

    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    let events = orchestrator
        .start(StartMode::Resume, at(t0, 5))
        .expect("resume");
    assert!(matches!(
        events.as_slice(),
        [OrchestratorEvent::CycleStarted { cycle: 1, .. }]
    ));
    assert_eq!(launcher.spawned_cycles(), vec![1, 1]);

    let state = project.load_state();
    assert_eq!(state.cycle_number, 1);
    assert_eq!(state.current_step, 1);
    assert_eq!(state.cycles.len(), 1);
    assert!(launcher.spawned()[1].instructions.contains("next step number is **2**"));
}

#[test]
fn resume_after_ended_cycle_terminates_orphan_and_spawns_next() {
    let project = TestProject::new().expect("project");
    let store = project.store();
    let mut state = cycler::core::types::OrchestrationState::for_plan("plan-orphan");
    store.save(&mut state).expect("save");
    store
        .record_cycle_start(
            &mut state,
            3,
            WorkerRecord {
                pid: 777,
                started_at: chrono::Utc::now(),
                directory: project.root().to_path_buf(),
            },
        )
        .expect("cycle start");
    store
        .record_cycle_end(
            &mut state,
            3,
            EndReason::Normal,
            chrono::Utc::now(),
            None,
            None,
        )
        .expect("cycle end");

    let launcher = ScriptedLauncher::new([ScriptedSpawn::silent()]);
    launcher.set_alive(777, true);
    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    let events = orchestrator
        .start(StartMode::Resume, Instant::now())
        .expect("resume");

    assert_eq!(events[0], OrchestratorEvent::OrphanTerminated { pid: 777 });
    assert!(matches!(
        events[1],
        OrchestratorEvent::CycleStarted { cycle: 4, .. }
    ));
    assert_eq!(launcher.terminated(), vec![777]);
    assert_eq!(project.load_state().cycle_number, 4);
}

#[test]
fn stop_records_ended_by_stop_and_resume_continues_at_next_cycle() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::silent(), ScriptedSpawn::silent()]);
    let t0 = Instant::now();
    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    orchestrator.start(fresh("plan-stop"), t0).expect("start");
    let pid = orchestrator.worker_pid().expect("worker");

    let events = orchestrator.stop().expect("stop");
    assert_eq!(
        events,
        vec![
            OrchestratorEvent::CycleEnded {
                cycle: 1,
                status: CycleStatus::EndedByStop
            },
            OrchestratorEvent::Stopped,
        ]
    );
    assert_eq!(orchestrator.phase(), &Phase::Idle);
    assert_eq!(launcher.terminated(), vec![pid]);
    assert!(orchestrator.stop().expect("stop again").is_empty());

    let events = orchestrator
        .start(StartMode::Resume, at(t0, 10))
        .expect("resume");
    assert!(matches!(
        events.as_slice(),
        [OrchestratorEvent::CycleStarted { cycle: 2, .. }]
    ));
}

/// Stop between cycles: nothing is running, so no cycle end is recorded.
#[test]
fn stop_while_spawning_next_cycle_leaves_previous_end_intact() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::messages([WorkerMessage::end_of_cycle()])]);
    let t0 = Instant::now();
    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    orchestrator.start(fresh("plan-gap"), t0).expect("start");
    orchestrator.tick(at(t0, 1)).expect("tick");
    assert_eq!(orchestrator.phase(), &Phase::Spawning { cycle: 2 });

    assert_eq!(
        orchestrator.stop().expect("stop"),
        vec![OrchestratorEvent::Stopped]
    );
    assert_eq!(launcher.spawned_cycles(), vec![1]);
    let state = project.load_state();
    assert_eq!(state.cycle_number, 1);
    assert_eq!(state.cycle_status, Some(CycleStatus::EndedNormally));
}

#[test]
fn completed_plan_refuses_resume_but_accepts_fresh_start() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([
        ScriptedSpawn::messages([WorkerMessage::step(1, "all"), WorkerMessage::plan_complete()]),
        ScriptedSpawn::silent(),
    ]);
    let t0 = Instant::now();
    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    orchestrator.start(fresh("plan-done"), t0).expect("start");
    run_until_settled(&mut orchestrator, t0);
    assert!(orchestrator.tick(at(t0, 100)).expect("tick").is_empty());

    let err = orchestrator
        .start(StartMode::Resume, at(t0, 101))
        .unwrap_err();
    assert!(err.to_string().contains("already completed"), "{err}");

    orchestrator
        .start(fresh("plan-next"), at(t0, 102))
        .expect("fresh");
    let state = project.load_state();
    assert_eq!(state.plan_id.as_deref(), Some("plan-next"));
    assert_eq!(state.cycle_number, 1);
    assert!(state.history.is_empty());
}

#[test]
fn fresh_start_terminates_live_worker_of_superseded_plan() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::silent(), ScriptedSpawn::silent()]);
    let t0 = Instant::now();
    let old_pid = {
        let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
        orchestrator.start(fresh("plan-old"), t0).expect("start");
        orchestrator.worker_pid().expect("worker")
    };

    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    let events = orchestrator
        .start(fresh("plan-new"), at(t0, 1))
        .expect("fresh");
    assert_eq!(events[0], OrchestratorEvent::OrphanTerminated { pid: old_pid });
    assert!(matches!(
        events[1],
        OrchestratorEvent::CycleStarted { cycle: 1, .. }
    ));
    assert_eq!(launcher.terminated(), vec![old_pid]);
}

#[test]
fn spawn_failure_leaves_orchestrator_idle() {
    let project = TestProject::new().expect("project");
    let mut config = project.config();
    config.worker_directory = project.root().join("missing");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::silent()]);
    let mut orchestrator = Orchestrator::new(
        project.paths().clone(),
        config,
        launcher.clone(),
        ManualArbiter::new(),
    );

    let err = orchestrator
        .start(fresh("plan-nodir"), Instant::now())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SpawnFailed>(),
        Some(SpawnFailed::MissingDirectory(_))
    ));
    assert_eq!(orchestrator.phase(), &Phase::Idle);
    assert!(launcher.spawned().is_empty());
    assert_eq!(project.load_state().cycle_status, None);
}

#[test]
fn spawn_failure_between_cycles_keeps_finished_cycle() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([
        ScriptedSpawn::messages([WorkerMessage::end_of_cycle()]),
        ScriptedSpawn::Fail("terminal unavailable".to_string()),
    ]);
    let t0 = Instant::now();
    let mut orchestrator = project.orchestrator(launcher.clone(), ManualArbiter::new());
    orchestrator.start(fresh("plan-fail2"), t0).expect("start");
    orchestrator.tick(at(t0, 1)).expect("end");

    let err = orchestrator.tick(at(t0, 2)).unwrap_err();
    assert!(err.downcast_ref::<SpawnFailed>().is_some());
    assert_eq!(orchestrator.phase(), &Phase::Idle);
    let state = project.load_state();
    assert_eq!(state.cycle_number, 1);
    assert_eq!(state.cycle_status, Some(CycleStatus::EndedNormally));
}

#[test]
fn resolving_without_pending_stall_is_refused() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::silent()]);
    let mut orchestrator = project.orchestrator(launcher, ManualArbiter::new());
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-none"), t0).expect("start");

    let err = orchestrator
        .resolve_stall(StallDecision::ConfirmTerminate, at(t0, 1))
        .unwrap_err();
    assert!(err.downcast_ref::<NoStallPending>().is_some());
    assert_eq!(orchestrator.phase(), &Phase::Running { cycle: 1 });
}

#[derive(Clone, Default)]
struct RecordingRegistry {
    calls: Rc<RefCell<Vec<String>>>,
}

impl ServiceRegistry for RecordingRegistry {
    fn register(&mut self, name: &str) -> Result<()> {
        self.calls.borrow_mut().push(format!("register {name}"));
        Ok(())
    }

    fn heartbeat(&mut self) -> Result<()> {
        self.calls.borrow_mut().push("heartbeat".to_string());
        Ok(())
    }

    fn deregister(&mut self, name: &str) -> Result<()> {
        self.calls.borrow_mut().push(format!("deregister {name}"));
        Ok(())
    }
}

#[test]
fn registry_sees_register_heartbeat_and_deregister() {
    let project = TestProject::new().expect("project");
    let launcher = ScriptedLauncher::new([ScriptedSpawn::messages([WorkerMessage::plan_complete()])]);
    let registry = RecordingRegistry::default();
    let mut orchestrator = project
        .orchestrator(launcher, ManualArbiter::new())
        .with_registry(Box::new(registry.clone()));
    let t0 = Instant::now();
    orchestrator.start(fresh("plan-reg"), t0).expect("start");
    run_until_settled(&mut orchestrator, t0);

    assert_eq!(
        registry.calls.borrow().as_slice(),
        [
            "register cycler-test".to_string(),
            "heartbeat".to_string(),
            "deregister cycler-test".to_string(),
        ]
    );
}
