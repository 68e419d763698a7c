//! Cycle orchestration for long-running coding-assistant workers.
//!
//! A supervisor spawns one worker process per cycle, listens for its progress
//! reports on a per-cycle local channel, detects stalls with a watchdog and,
//! only after explicit confirmation, terminates and respawns it. The
//! orchestration state is persisted after every mutation so a restarted
//! supervisor resumes at the same cycle.
//!
//! - **[`core`]**: Pure, deterministic logic (message model, watchdog, phases,
//!   resume rules, state invariants). No I/O.
//! - **[`io`]**: Side-effecting operations (state file, sockets, processes,
//!   config, templates). Isolated behind traits so tests substitute doubles.
//!
//! [`orchestrator`] composes the two into the cycle state machine;
//! [`start`], [`looping`] and [`status`] implement the CLI commands.

pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod orchestrator;
pub mod start;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
