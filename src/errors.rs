//! Error types for event ingestion.

use std::fmt::{Display, Formatter};

/// Reasons a raw lifecycle event is dropped before reaching the registry.
/// All of these are non-fatal: the ingestor logs them and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// The event's status string is outside the closed enumeration.
    UnknownStatus { agent_id: String, raw: String },
    /// Strict mode only: the agent appears in no catalog workflow.
    UnknownAgent { agent_id: String },
    /// The event's dedup key was already seen (at-least-once redelivery).
    Duplicate { agent_id: String, key: String },
}

impl Display for IngestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownStatus { agent_id, raw } => {
                write!(f, "unknown status '{}' for agent '{}'", raw, agent_id)
            }
            Self::UnknownAgent { agent_id } => {
                write!(f, "agent '{}' is not part of any workflow", agent_id)
            }
            Self::Duplicate { agent_id, key } => {
                write!(f, "duplicate event {} for agent '{}'", key, agent_id)
            }
        }
    }
}

impl std::error::Error for IngestError {}
