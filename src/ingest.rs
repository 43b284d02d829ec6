//! Normalization and idempotent ingestion of lifecycle events.
//!
//! Both ingestion paths (push stream and periodic poll) deliver raw
//! [`LifecycleEvent`]s here. The ingestor validates the status against the
//! closed enumeration, drops redelivered events via a bounded dedup
//! window, and applies survivors through [`StatusRegistry::apply`]. The
//! registry's staleness rule handles out-of-order arrival, so no ordering
//! buffer is needed beyond the dedup key.

use crate::catalog::WorkflowSequenceCatalog;
use crate::config::TrackerConfig;
use crate::errors::IngestError;
use crate::registry::{ApplyOutcome, StatusRegistry};
use crate::status::{AgentStatus, AgentStatusInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// Wire form of one lifecycle transition, as delivered by the agent
/// runtime over the push stream or inside a poll response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub agent_id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub progress_percentage: Option<u8>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    ById {
        agent_id: String,
        event_id: String,
    },
    /// Fallback when the producer sends no event id: exact repeats of the
    /// same transition at the same timestamp.
    ByContent {
        agent_id: String,
        status: AgentStatus,
        timestamp: DateTime<Utc>,
    },
}

impl DedupKey {
    fn describe(&self) -> String {
        match self {
            Self::ById { event_id, .. } => format!("id '{}'", event_id),
            Self::ByContent { status, timestamp, .. } => {
                format!("'{}' at {}", status, timestamp.to_rfc3339())
            }
        }
    }
}

/// FIFO-bounded set of recently seen dedup keys.
struct DedupWindow {
    seen: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the key was already present.
    fn insert(&mut self, key: DedupKey) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

pub struct EventIngestor {
    registry: Arc<StatusRegistry>,
    catalog: Arc<WorkflowSequenceCatalog>,
    dedup: Mutex<DedupWindow>,
    strict_agent_ids: bool,
}

impl EventIngestor {
    pub fn new(
        registry: Arc<StatusRegistry>,
        catalog: Arc<WorkflowSequenceCatalog>,
        config: &TrackerConfig,
    ) -> Self {
        Self {
            registry,
            catalog,
            dedup: Mutex::new(DedupWindow::new(config.dedup_capacity)),
            strict_agent_ids: config.strict_agent_ids,
        }
    }

    /// Validates, deduplicates, and applies one raw event. Returns the
    /// accepted status record when the registry state changed; `None` for
    /// drops of any kind (never an error, never a panic).
    pub fn ingest(&self, raw: &LifecycleEvent) -> Option<AgentStatusInfo> {
        let candidate = match self.normalize(raw) {
            Ok(candidate) => candidate,
            Err(err @ IngestError::Duplicate { .. }) => {
                tracing::debug!(%err, "dropping redelivered lifecycle event");
                return None;
            }
            Err(err) => {
                tracing::warn!(%err, "dropping lifecycle event");
                return None;
            }
        };

        match self.registry.apply(candidate) {
            ApplyOutcome::Changed(info) => Some(info),
            ApplyOutcome::Stale | ApplyOutcome::InvalidTransition { .. } => None,
        }
    }

    fn normalize(&self, raw: &LifecycleEvent) -> Result<AgentStatusInfo, IngestError> {
        let status =
            AgentStatus::parse(&raw.status).ok_or_else(|| IngestError::UnknownStatus {
                agent_id: raw.agent_id.clone(),
                raw: raw.status.clone(),
            })?;

        if self.strict_agent_ids && !self.catalog.contains_agent(&raw.agent_id) {
            return Err(IngestError::UnknownAgent {
                agent_id: raw.agent_id.clone(),
            });
        }

        let key = match &raw.event_id {
            Some(event_id) => DedupKey::ById {
                agent_id: raw.agent_id.clone(),
                event_id: event_id.clone(),
            },
            None => DedupKey::ByContent {
                agent_id: raw.agent_id.clone(),
                status,
                timestamp: raw.timestamp,
            },
        };
        let fresh = self
            .dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        if !fresh {
            return Err(IngestError::Duplicate {
                agent_id: raw.agent_id.clone(),
                key: key.describe(),
            });
        }

        let stored = self.registry.get(&raw.agent_id);
        // A starting event opens a run; everything else continues the one
        // already on record.
        let execution_start = if status == AgentStatus::Starting
            || stored.status == AgentStatus::Idle
        {
            raw.timestamp
        } else {
            stored.execution_start
        };

        Ok(AgentStatusInfo {
            agent_id: raw.agent_id.clone(),
            status,
            progress_percentage: raw
                .progress_percentage
                .unwrap_or(stored.progress_percentage),
            execution_start,
            execution_time_ms: raw.execution_time_ms,
            retry_count: raw.retry_count.unwrap_or(stored.retry_count),
            error_message: raw.error_message.clone(),
            observed_at: raw.timestamp,
        })
    }
}
