//! Error taxonomy for the orchestration subsystem.
//!
//! Only [`SpawnFailed`] ever aborts a plan. The other variants are absorbed
//! where they occur and logged.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The worker process could not be created. Not retried automatically.
#[derive(Debug, Error)]
pub enum SpawnFailed {
    #[error("worker directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("worker command is empty")]
    EmptyCommand,

    #[error("failed to prepare worker log {}: {source}", path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to launch worker `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot open channel {}: {reason}", path.display())]
    Channel { path: PathBuf, reason: String },

    #[error("failed to prepare cycle: {0}")]
    Prepare(String),

    #[error("worker launch rejected: {0}")]
    Rejected(String),
}

/// Nobody is listening on the channel right now.
///
/// Expected while the supervisor is between cycles; the sender should treat it
/// as "try again later".
#[derive(Debug, Error)]
#[error("channel {} unavailable: {reason}", path.display())]
pub struct ChannelUnavailable {
    pub path: PathBuf,
    pub reason: String,
}

/// An inbound record that does not parse into a known message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed message: {reason} (record: {excerpt})")]
pub struct MalformedMessage {
    pub reason: String,
    /// Leading bytes of the offending record, for logs.
    pub excerpt: String,
}

impl MalformedMessage {
    const EXCERPT_CHARS: usize = 120;

    pub fn new(reason: impl Into<String>, record: &str) -> Self {
        let excerpt: String = record.chars().take(Self::EXCERPT_CHARS).collect();
        Self {
            reason: reason.into(),
            excerpt,
        }
    }
}

/// The persisted state could not be used; callers fall back to a fresh state.
#[derive(Debug, Error)]
#[error("state file {} is corrupt: {reason}", path.display())]
pub struct StateCorrupt {
    pub path: PathBuf,
    pub reason: String,
}

/// `decide` was called while no stall awaits confirmation.
#[derive(Debug, Error)]
#[error("no stall is awaiting confirmation")]
pub struct NoStallPending;
