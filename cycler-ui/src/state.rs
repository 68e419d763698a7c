//! Shared application state for the UI server.

use std::path::PathBuf;
use std::sync::Arc;

use cycler::io::init::CyclerPaths;
use tokio::sync::broadcast;

/// Events broadcast to SSE clients when `.cycler/` changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    StateChanged,
    /// Stall evidence appeared; the supervisor awaits a decision.
    StallRaised,
    StallCleared,
    CycleAdded {
        plan_id: String,
        cycle: u32,
    },
    /// `meta.json` written for an ended cycle.
    CycleCompleted {
        plan_id: String,
        cycle: u32,
    },
    ConfigChanged,
}

#[derive(Clone)]
pub struct AppState {
    pub paths: CyclerPaths,
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(project_dir: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            paths: CyclerPaths::new(project_dir),
            event_tx: Arc::new(event_tx),
        }
    }
}
