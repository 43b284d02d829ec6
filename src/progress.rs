//! Workflow progress aggregation.
//!
//! `WorkflowProgress` is derived, never stored: a pure fold of a catalog
//! definition against a registry snapshot, recomputed on demand and on
//! every relevant status change.

use crate::catalog::WorkflowDefinition;
use crate::status::{derive_outcome, AgentStatus, AgentStatusInfo, StepOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Aggregate progress of one workflow against the live status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    /// Earliest run start among reported steps; `None` while pending.
    pub started_at: Option<DateTime<Utc>>,
    /// 0-indexed frontier of started work (see `aggregate`).
    pub current_step: usize,
    pub completed_steps: usize,
    pub running_steps: usize,
    pub failed_steps: usize,
    pub pending_steps: usize,
    pub total_steps: usize,
    /// `completed / total`, integer-rounded; 100 exactly when every step
    /// completed.
    pub completion_percentage: u8,
    /// Advisory ETA: `started_at` plus the estimated duration of every
    /// incomplete step. Only while running.
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Folds the declared sequence against the snapshot.
///
/// `current_step` is the frontier of actually-started work: the highest
/// index whose predecessors are all completed, extended forward across the
/// contiguous run of active steps that follows.
///
/// A step that is `failed` or `timeout` with no fresh run since marks the
/// whole workflow failed; a blocked pipeline never reports partial
/// success.
pub fn aggregate(
    definition: &WorkflowDefinition,
    snapshot: &HashMap<String, AgentStatusInfo>,
) -> WorkflowProgress {
    let total = definition.total_steps();
    let outcomes: Vec<StepOutcome> = definition
        .steps
        .iter()
        .map(|step| {
            snapshot
                .get(&step.agent_id)
                .map_or(StepOutcome::Pending, derive_outcome)
        })
        .collect();

    let completed = outcomes
        .iter()
        .filter(|o| **o == StepOutcome::Completed)
        .count();
    let running = outcomes
        .iter()
        .filter(|o| **o == StepOutcome::Active)
        .count();
    let failed = outcomes
        .iter()
        .filter(|o| **o == StepOutcome::Blocked)
        .count();
    let pending = total - completed - running - failed;

    let started_at = definition
        .steps
        .iter()
        .filter_map(|step| snapshot.get(&step.agent_id))
        .filter(|info| info.status != AgentStatus::Idle)
        .map(|info| info.execution_start)
        .min();

    let status = if total > 0 && completed == total {
        WorkflowStatus::Completed
    } else if failed > 0 {
        WorkflowStatus::Failed
    } else if completed > 0 || running > 0 {
        WorkflowStatus::Running
    } else {
        WorkflowStatus::Pending
    };

    let leading_completed = outcomes
        .iter()
        .take_while(|o| **o == StepOutcome::Completed)
        .count();
    let mut frontier = leading_completed;
    while frontier < total && outcomes[frontier] == StepOutcome::Active {
        frontier += 1;
    }
    let current_step = if frontier > leading_completed {
        frontier - 1
    } else {
        leading_completed.min(total.saturating_sub(1))
    };

    let completion_percentage = percentage(completed, total);

    let estimated_completion = if status == WorkflowStatus::Running {
        started_at.map(|start| {
            let remaining = definition
                .steps
                .iter()
                .zip(&outcomes)
                .filter(|(_, outcome)| **outcome != StepOutcome::Completed)
                .map(|(step, _)| step.estimated_duration())
                .fold(chrono::Duration::zero(), |acc, d| acc + d);
            start + remaining
        })
    } else {
        None
    };

    WorkflowProgress {
        workflow_id: definition.workflow_id.clone(),
        status,
        started_at,
        current_step,
        completed_steps: completed,
        running_steps: running,
        failed_steps: failed,
        pending_steps: pending,
        total_steps: total,
        completion_percentage,
        estimated_completion,
    }
}

/// Integer-rounded completion share, pinned so that 100 is reported
/// exactly when every step is completed and never before.
fn percentage(completed: usize, total: usize) -> u8 {
    if total == 0 || completed == total {
        return 100;
    }
    let rounded = (completed * 100 + total / 2) / total;
    u8::try_from(rounded.min(99)).unwrap_or(99)
}
