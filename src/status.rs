//! Agent lifecycle model.
//!
//! Defines the closed status enumeration, the legal transition table, and
//! the per-agent status record the registry stores. The transition table is
//! the single authority on which lifecycle edges exist; everything else
//! (registry admission, progress aggregation, the watchdog) consults it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Lifecycle status of a single agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Timeout,
    Retrying,
}

impl AgentStatus {
    /// Terminal states end a run; further updates for the same run are
    /// rejected by the registry.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    /// Active states count toward a workflow's in-flight frontier.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Retrying)
    }

    /// Whether `next` is a legal lifecycle edge from this status.
    ///
    /// ```text
    /// idle      -> starting
    /// starting  -> running | failed | timeout
    /// running   -> completed | failed | timeout | retrying
    /// retrying  -> starting
    /// ```
    /// Terminal states have no outgoing edges; a new run re-enters through
    /// `starting` and is admitted separately by the registry.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Timeout)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Retrying)
                | (Retrying, Starting)
        )
    }

    /// Parses the wire representation. Returns `None` for anything outside
    /// the closed enumeration.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(Self::Idle),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Retrying => "retrying",
        }
    }
}

impl Display for AgentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest known state of one agent. The registry keeps exactly one of
/// these per `agent_id`; consumers only ever receive copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusInfo {
    pub agent_id: String,
    pub status: AgentStatus,
    /// 0-100, meaningful only while `running`.
    pub progress_percentage: u8,
    /// Wall-clock start of the current run.
    pub execution_start: DateTime<Utc>,
    /// Measured duration, set only on terminal states.
    pub execution_time_ms: Option<u64>,
    /// Never decreases within a run; resets when a new run starts.
    pub retry_count: u32,
    /// Present only on `failed` / `timeout`.
    pub error_message: Option<String>,
    /// Timestamp of the event that produced this record; the registry's
    /// staleness rule compares against it.
    pub observed_at: DateTime<Utc>,
}

impl AgentStatusInfo {
    /// Default record for an agent that has never reported.
    pub fn idle(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status: AgentStatus::Idle,
            progress_percentage: 0,
            execution_start: DateTime::UNIX_EPOCH,
            execution_time_ms: None,
            retry_count: 0,
            error_message: None,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }
}

/// Outcome of a workflow step, derived purely from the stored status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Never reported, or reported idle.
    Pending,
    /// Starting, running, or retrying.
    Active,
    Completed,
    /// Failed or timed out with no fresh run since.
    Blocked,
}

/// Canonical step-outcome rule: the lifecycle status alone decides the
/// outcome. Sync or poll timestamps never imply success; a poll result can
/// only change the outcome by carrying a lifecycle status through the
/// registry.
pub fn derive_outcome(info: &AgentStatusInfo) -> StepOutcome {
    match info.status {
        AgentStatus::Idle => StepOutcome::Pending,
        AgentStatus::Starting | AgentStatus::Running | AgentStatus::Retrying => StepOutcome::Active,
        AgentStatus::Completed => StepOutcome::Completed,
        AgentStatus::Failed | AgentStatus::Timeout => StepOutcome::Blocked,
    }
}
