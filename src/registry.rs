//! The status registry: single source of truth for agent lifecycle state.
//!
//! All mutation goes through [`StatusRegistry::apply`], which validates the
//! candidate against the transition table and the staleness rule, then
//! replaces the stored record wholesale. Reads are copies; the map lock is
//! held only for the admission check and the copy, never across subscriber
//! notification or network waits.

use crate::status::{AgentStatus, AgentStatusInfo};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Result of offering a candidate update to the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The candidate was accepted and is now the stored record. The caller
    /// is responsible for fanning the change out to subscribers.
    Changed(AgentStatusInfo),
    /// The candidate's timestamp was not newer than the stored record, or
    /// it replayed a finished run. Dropped silently.
    Stale,
    /// The implied lifecycle edge is not in the transition table.
    InvalidTransition { from: AgentStatus, to: AgentStatus },
}

impl ApplyOutcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed(_))
    }
}

enum Admission {
    /// Continue the current run.
    Accept,
    /// Fresh run on top of a terminal state.
    NewRun,
    Stale,
    Invalid,
}

#[derive(Default)]
pub struct StatusRegistry {
    agents: Mutex<HashMap<String, AgentStatusInfo>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers a candidate update. Invalid transitions and stale timestamps
    /// are no-ops; on acceptance the normalized record replaces the stored
    /// one and is returned for fan-out.
    pub fn apply(&self, candidate: AgentStatusInfo) -> ApplyOutcome {
        let mut agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        let current = agents
            .get(&candidate.agent_id)
            .cloned()
            .unwrap_or_else(|| AgentStatusInfo::idle(&candidate.agent_id));

        match admit(&current, &candidate) {
            Admission::Stale => {
                tracing::debug!(
                    agent_id = %candidate.agent_id,
                    status = %candidate.status,
                    "dropping stale status update"
                );
                ApplyOutcome::Stale
            }
            Admission::Invalid => {
                tracing::warn!(
                    agent_id = %candidate.agent_id,
                    from = %current.status,
                    to = %candidate.status,
                    "rejecting invalid status transition"
                );
                ApplyOutcome::InvalidTransition {
                    from: current.status,
                    to: candidate.status,
                }
            }
            admission @ (Admission::Accept | Admission::NewRun) => {
                let new_run = matches!(admission, Admission::NewRun);
                let accepted = normalize(&current, candidate, new_run);
                agents.insert(accepted.agent_id.clone(), accepted.clone());
                ApplyOutcome::Changed(accepted)
            }
        }
    }

    /// Immutable copy of the full map. Writers are blocked only for the
    /// duration of the copy.
    pub fn snapshot(&self) -> HashMap<String, AgentStatusInfo> {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest record for one agent, if it has ever reported.
    pub fn lookup(&self, agent_id: &str) -> Option<AgentStatusInfo> {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    /// Latest record for one agent; a synthesized `idle` default if the
    /// agent has never reported. Never an error.
    pub fn get(&self, agent_id: &str) -> AgentStatusInfo {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| AgentStatusInfo::idle(agent_id))
    }
}

fn admit(current: &AgentStatusInfo, candidate: &AgentStatusInfo) -> Admission {
    if current.status.is_terminal() {
        // A strictly newer execution_start signals a fresh run, which must
        // re-enter through `starting` (the only edge out of idle).
        if candidate.execution_start > current.execution_start {
            if candidate.status == AgentStatus::Starting {
                Admission::NewRun
            } else {
                Admission::Invalid
            }
        } else {
            Admission::Stale
        }
    } else if candidate.observed_at <= current.observed_at {
        Admission::Stale
    } else if candidate.status == current.status {
        // Non-terminal self-refresh: progress or retry-count update.
        Admission::Accept
    } else if current.status.can_transition_to(candidate.status) {
        Admission::Accept
    } else {
        Admission::Invalid
    }
}

/// Enforces the field invariants the data model promises: run-stable
/// `execution_start`, monotone `retry_count`, duration and error message
/// only on the states they belong to.
fn normalize(
    current: &AgentStatusInfo,
    mut accepted: AgentStatusInfo,
    new_run: bool,
) -> AgentStatusInfo {
    if !new_run {
        let opens_attempt = current.status == AgentStatus::Idle
            || (current.status == AgentStatus::Retrying
                && accepted.status == AgentStatus::Starting);
        if !opens_attempt {
            accepted.execution_start = current.execution_start;
        }
        accepted.retry_count = if accepted.status == AgentStatus::Retrying {
            accepted.retry_count.max(current.retry_count + 1)
        } else {
            accepted.retry_count.max(current.retry_count)
        };
    }

    accepted.progress_percentage = accepted.progress_percentage.min(100);

    if accepted.status.is_terminal() {
        if accepted.execution_time_ms.is_none() {
            let elapsed = accepted
                .observed_at
                .signed_duration_since(accepted.execution_start)
                .num_milliseconds()
                .max(0);
            accepted.execution_time_ms = Some(elapsed.unsigned_abs());
        }
        if accepted.status == AgentStatus::Completed {
            accepted.progress_percentage = 100;
            accepted.error_message = None;
        }
    } else {
        accepted.execution_time_ms = None;
        accepted.error_message = None;
    }

    accepted
}
