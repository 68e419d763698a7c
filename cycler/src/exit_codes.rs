//! Stable exit codes for `cycler` commands.

/// Command succeeded, the plan completed, or the loop was stopped.
pub const OK: i32 = 0;
/// Invalid usage, config or state, or any other unexpected error.
pub const INVALID: i32 = 1;
/// A worker process could not be launched.
pub const SPAWN_FAILED: i32 = 2;
/// `cycler send` could not reach the cycle's channel.
pub const CHANNEL_UNAVAILABLE: i32 = 3;
/// `cycler decide` found no stall awaiting confirmation.
pub const NO_STALL_PENDING: i32 = 4;
