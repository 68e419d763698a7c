//! Server-Sent Events stream and `.cycler/` file watcher.

use std::collections::{BTreeSet, HashSet};
use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use cycler::io::init::CyclerPaths;
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::state::{AppState, ChangeEvent};

type CycleKey = (String, u32);

#[derive(Serialize)]
struct SsePayload<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cycle: Option<u32>,
}

impl<'a> From<&'a ChangeEvent> for SsePayload<'a> {
    fn from(event: &'a ChangeEvent) -> Self {
        let (event_type, key) = match event {
            ChangeEvent::StateChanged => ("state_changed", None),
            ChangeEvent::StallRaised => ("stall_raised", None),
            ChangeEvent::StallCleared => ("stall_cleared", None),
            ChangeEvent::CycleAdded { plan_id, cycle } => ("cycle_added", Some((plan_id, cycle))),
            ChangeEvent::CycleCompleted { plan_id, cycle } => {
                ("cycle_completed", Some((plan_id, cycle)))
            }
            ChangeEvent::ConfigChanged => ("config_changed", None),
        };
        SsePayload {
            event_type,
            plan_id: key.map(|(plan_id, _)| plan_id.as_str()),
            cycle: key.map(|(_, cycle)| *cycle),
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    if let Ok(json) = serde_json::to_string(&SsePayload::from(&change_event)) {
                        yield Ok(Event::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the file watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(250)),
    )?;

    let cycler_dir = &state.paths.cycler_dir;
    if cycler_dir.exists() {
        watcher.watch(cycler_dir, RecursiveMode::Recursive)?;
        info!(path = %cycler_dir.display(), "watching cycler directory");
    } else {
        warn!(path = %cycler_dir.display(), "cycler directory missing, nothing to watch");
    }

    let mut known_cycles = collect_known_cycles(&state.paths.cycles_dir);

    // Batch at a fixed interval so a continuously written worker.log cannot
    // starve the other notifications.
    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(100));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => pending_events.push(event),
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                for change in classify(&state.paths, &pending_events, &mut known_cycles) {
                    debug!(?change, "broadcasting change");
                    let _ = state.event_tx.send(change);
                }
                pending_events.clear();
            }
        }
    }
}

/// Turn one batch of raw file events into deduplicated change notifications.
///
/// Order: state, stall, config, then added cycles and completed cycles
/// sorted by (plan, cycle). Only the last stall transition in a batch is
/// reported.
pub fn classify(
    paths: &CyclerPaths,
    events: &[NotifyEvent],
    known_cycles: &mut HashSet<CycleKey>,
) -> Vec<ChangeEvent> {
    let mut state_changed = false;
    let mut config_changed = false;
    let mut stall_present: Option<bool> = None;
    let mut added = BTreeSet::new();
    let mut completed = BTreeSet::new();

    for event in events {
        let removed = matches!(event.kind, EventKind::Remove(_));
        if !removed && !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }

        for path in &event.paths {
            if path == &paths.stall_evidence_path {
                stall_present = Some(!removed);
            } else if removed {
                continue;
            } else if path == &paths.state_path {
                state_changed = true;
            } else if path == &paths.config_path {
                config_changed = true;
            } else if let Some(key) = parse_cycle_path(&paths.cycles_dir, path) {
                if known_cycles.insert(key.clone()) {
                    added.insert(key.clone());
                }
                if path.file_name().and_then(|n| n.to_str()) == Some("meta.json") {
                    completed.insert(key);
                }
            }
        }
    }

    let mut changes = Vec::new();
    if state_changed {
        changes.push(ChangeEvent::StateChanged);
    }
    match stall_present {
        Some(true) => changes.push(ChangeEvent::StallRaised),
        Some(false) => changes.push(ChangeEvent::StallCleared),
        None => {}
    }
    if config_changed {
        changes.push(ChangeEvent::ConfigChanged);
    }
    changes.extend(
        added
            .into_iter()
            .map(|(plan_id, cycle)| ChangeEvent::CycleAdded { plan_id, cycle }),
    );
    changes.extend(
        completed
            .into_iter()
            .map(|(plan_id, cycle)| ChangeEvent::CycleCompleted { plan_id, cycle }),
    );
    changes
}

fn collect_known_cycles(cycles_dir: &Path) -> HashSet<CycleKey> {
    let mut known = HashSet::new();
    let Ok(plans) = std::fs::read_dir(cycles_dir) else {
        return known;
    };
    for plan_entry in plans.flatten() {
        let plan_path = plan_entry.path();
        let Ok(cycles) = std::fs::read_dir(&plan_path) else {
            continue;
        };
        for cycle_entry in cycles.flatten() {
            let cycle_path = cycle_entry.path();
            if cycle_path.is_dir()
                && let Some(key) = parse_cycle_path(cycles_dir, &cycle_path)
            {
                known.insert(key);
            }
        }
    }
    known
}

/// `cycles/<plan>/<N>/...` -> `(plan, N)`.
fn parse_cycle_path(cycles_dir: &Path, path: &Path) -> Option<CycleKey> {
    let rel = path.strip_prefix(cycles_dir).ok()?;
    let mut components = rel.components();

    let plan_id = components.next()?.as_os_str().to_str()?.to_string();
    let cycle = components.next()?.as_os_str().to_str()?.parse::<u32>().ok()?;
    Some((plan_id, cycle))
}
