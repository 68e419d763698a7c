//! Inbound worker message model and record parsing.
//!
//! Each record on the channel is one JSON object discriminated by `kind`.
//! Unknown kinds deserialize to [`WorkerMessage::Unknown`] and are rejected by
//! [`parse_message`], so callers only ever see the four known kinds.

use serde::{Deserialize, Serialize};

use crate::core::types::MessageKind;
use crate::errors::MalformedMessage;

/// Largest accepted record, in bytes.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    StatusUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_used_percent: Option<f64>,
    },
    StepComplete {
        /// Plan-global step number; assigned by the supervisor when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_used_percent: Option<f64>,
    },
    EndOfCycle {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_used_percent: Option<f64>,
    },
    PlanComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_used_percent: Option<f64>,
    },
    #[serde(other)]
    Unknown,
}

impl WorkerMessage {
    pub fn status(text: impl Into<String>) -> Self {
        WorkerMessage::StatusUpdate {
            text: Some(text.into()),
            tokens_used_percent: None,
        }
    }

    pub fn step(step: u32, description: impl Into<String>) -> Self {
        WorkerMessage::StepComplete {
            step: Some(step),
            description: Some(description.into()),
            tokens_used_percent: None,
        }
    }

    pub fn end_of_cycle() -> Self {
        WorkerMessage::EndOfCycle {
            text: None,
            tokens_used_percent: None,
        }
    }

    pub fn plan_complete() -> Self {
        WorkerMessage::PlanComplete {
            text: None,
            tokens_used_percent: None,
        }
    }

    /// Known kind, or `None` for [`WorkerMessage::Unknown`].
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            WorkerMessage::StatusUpdate { .. } => Some(MessageKind::StatusUpdate),
            WorkerMessage::StepComplete { .. } => Some(MessageKind::StepComplete),
            WorkerMessage::EndOfCycle { .. } => Some(MessageKind::EndOfCycle),
            WorkerMessage::PlanComplete { .. } => Some(MessageKind::PlanComplete),
            WorkerMessage::Unknown => None,
        }
    }

    pub fn tokens_used_percent(&self) -> Option<f64> {
        match self {
            WorkerMessage::StatusUpdate {
                tokens_used_percent,
                ..
            }
            | WorkerMessage::StepComplete {
                tokens_used_percent,
                ..
            }
            | WorkerMessage::EndOfCycle {
                tokens_used_percent,
                ..
            }
            | WorkerMessage::PlanComplete {
                tokens_used_percent,
                ..
            } => *tokens_used_percent,
            WorkerMessage::Unknown => None,
        }
    }

    /// One-line human summary stored as `last_message.summary`.
    pub fn summary(&self) -> String {
        match self {
            WorkerMessage::StatusUpdate { text, .. } => text.clone().unwrap_or_default(),
            WorkerMessage::StepComplete {
                step, description, ..
            } => {
                let description = description.as_deref().unwrap_or("");
                match step {
                    Some(step) => format!("step {step}: {description}"),
                    None => description.to_string(),
                }
            }
            WorkerMessage::EndOfCycle { text, .. } => {
                text.clone().unwrap_or_else(|| "end of cycle".to_string())
            }
            WorkerMessage::PlanComplete { text, .. } => {
                text.clone().unwrap_or_else(|| "plan complete".to_string())
            }
            WorkerMessage::Unknown => String::new(),
        }
    }

    /// Serialize as a single channel record (no trailing newline).
    pub fn to_record(&self) -> String {
        // Infallible for this enum (string keys only).
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse one channel record into a known message.
pub fn parse_message(record: &str) -> Result<WorkerMessage, MalformedMessage> {
    let trimmed = record.trim();
    if trimmed.is_empty() {
        return Err(MalformedMessage::new("empty record", record));
    }
    if trimmed.len() > MAX_RECORD_BYTES {
        return Err(MalformedMessage::new(
            format!("record exceeds {MAX_RECORD_BYTES} bytes"),
            trimmed,
        ));
    }
    let message: WorkerMessage = serde_json::from_str(trimmed)
        .map_err(|err| MalformedMessage::new(err.to_string(), trimmed))?;
    if message == WorkerMessage::Unknown {
        return Err(MalformedMessage::new("unknown message kind", trimmed));
    }
    if let Some(percent) = message.tokens_used_percent()
        && !(percent.is_finite() && (0.0..=100.0).contains(&percent))
    {
        return Err(MalformedMessage::new(
            format!("tokens_used_percent out of range: {percent}"),
            trimmed,
        ));
    }
    if let WorkerMessage::StepComplete { step: Some(0), .. } = message {
        return Err(MalformedMessage::new("step numbers start at 1", trimmed));
    }
    Ok(message)
}
