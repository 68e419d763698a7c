//! Diagnostic tracing for the supervisor.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted.
//!
//! - **Cycle artifacts (`io/cycle_log`)**: `instructions.md`, `worker.log` and
//!   `meta.json` under `.cycler/cycles/`. Always written, unaffected by
//!   `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn` so stalls, malformed messages and
/// state recovery are visible without configuration. Output: stderr, compact.
///
/// # Example
/// ```bash
/// RUST_LOG=cycler=debug cycler start
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
