//! Agent status and workflow progress tracking.
//!
//! Maintains the authoritative lifecycle status of every marketing agent
//! and derives per-workflow progress from it. Status updates arrive as
//! at-least-once, possibly out-of-order lifecycle events over a push
//! stream and an optional reconciliation poll; a transition table plus a
//! staleness rule decide what the registry accepts, and every accepted
//! change fans out to subscribers. A watchdog promotes silently stalled
//! runs to `timeout`.
//!
//! [`AgentTracker`] wires the pieces together and is the intended entry
//! point; the individual modules are exported for callers that need finer
//! control.

mod bus;
mod catalog;
mod config;
mod errors;
mod ingest;
mod progress;
mod registry;
mod status;
mod stream;
mod watchdog;

pub use bus::{ObserverSet, Subscription};
pub use catalog::{WorkflowDefinition, WorkflowSequenceCatalog, WorkflowStep};
pub use config::TrackerConfig;
pub use errors::IngestError;
pub use ingest::{EventIngestor, LifecycleEvent};
pub use progress::{aggregate, WorkflowProgress, WorkflowStatus};
pub use registry::{ApplyOutcome, StatusRegistry};
pub use status::{derive_outcome, AgentStatus, AgentStatusInfo, StepOutcome};
pub use stream::{
    EventSink, StreamConnection, StreamHandle, StreamTransport, TcpConnection, TcpTransport,
    WebhookEvent,
};
pub use watchdog::{PollFn, WatchdogHandle};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct TrackerInner {
    registry: Arc<StatusRegistry>,
    ingestor: EventIngestor,
    status_bus: ObserverSet<AgentStatusInfo>,
    workflow_bus: ObserverSet<WorkflowProgress>,
    catalog: Arc<WorkflowSequenceCatalog>,
    config: TrackerConfig,
    /// Serializes admission plus fan-out so subscribers observe accepted
    /// changes in the order the registry accepted them.
    publish_order: Mutex<()>,
}

/// The assembled tracker: registry, ingestion, fan-out, watchdog and
/// stream wiring behind one cheaply cloneable handle.
#[derive(Clone)]
pub struct AgentTracker {
    inner: Arc<TrackerInner>,
}

impl AgentTracker {
    pub fn new(catalog: WorkflowSequenceCatalog, config: TrackerConfig) -> Self {
        let registry = Arc::new(StatusRegistry::new());
        let catalog = Arc::new(catalog);
        let ingestor = EventIngestor::new(registry.clone(), catalog.clone(), &config);
        Self {
            inner: Arc::new(TrackerInner {
                registry,
                ingestor,
                status_bus: ObserverSet::new(),
                workflow_bus: ObserverSet::new(),
                catalog,
                config,
                publish_order: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &WorkflowSequenceCatalog {
        &self.inner.catalog
    }

    /// Current status of every agent that has ever reported.
    pub fn latest_agent_statuses(&self) -> HashMap<String, AgentStatusInfo> {
        self.inner.registry.snapshot()
    }

    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatusInfo> {
        self.inner.registry.lookup(agent_id)
    }

    /// Validates and applies one raw lifecycle event; `true` when it
    /// changed the registry (and was fanned out).
    pub fn ingest(&self, raw: &LifecycleEvent) -> bool {
        let _order = self.publish_lock();
        match self.inner.ingestor.ingest(raw) {
            Some(info) => {
                self.fan_out(&info);
                true
            }
            None => false,
        }
    }

    /// Offers an already-normalized status record to the registry. Used by
    /// the watchdog; most callers want [`AgentTracker::ingest`].
    pub fn apply(&self, candidate: AgentStatusInfo) -> bool {
        let _order = self.publish_lock();
        match self.inner.registry.apply(candidate) {
            ApplyOutcome::Changed(info) => {
                self.fan_out(&info);
                true
            }
            ApplyOutcome::Stale | ApplyOutcome::InvalidTransition { .. } => false,
        }
    }

    /// Registers a callback for every accepted agent status change.
    ///
    /// Callbacks run on a dedicated task per subscription; a slow or
    /// panicking callback affects nobody else. Per subscriber, updates
    /// arrive in the order the registry accepted them.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AgentStatusInfo) + Send + Sync + 'static,
    {
        self.inner.status_bus.subscribe(callback)
    }

    /// Registers a callback for recomputed workflow progress. Fired for
    /// every workflow containing an agent whose status changed.
    pub fn subscribe_to_workflow<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WorkflowProgress) + Send + Sync + 'static,
    {
        self.inner.workflow_bus.subscribe(callback)
    }

    /// Progress for one workflow; `None` only when the id is not in the
    /// catalog. A known workflow nobody has reported for is `pending`.
    pub fn workflow_progress(&self, workflow_id: &str) -> Option<WorkflowProgress> {
        let definition = self.inner.catalog.get(workflow_id)?;
        Some(aggregate(definition, &self.inner.registry.snapshot()))
    }

    /// Progress for every catalog workflow, in catalog order.
    pub fn all_workflow_progress(&self) -> Vec<WorkflowProgress> {
        let snapshot = self.inner.registry.snapshot();
        self.inner
            .catalog
            .workflows()
            .iter()
            .map(|definition| aggregate(definition, &snapshot))
            .collect()
    }

    /// Starts the periodic watchdog. The task stops when the handle drops.
    pub fn spawn_watchdog(&self) -> WatchdogHandle {
        watchdog::spawn(self.clone(), None)
    }

    /// Watchdog plus a reconciliation poll run on every tick.
    pub fn spawn_watchdog_with_poll(&self, poll: PollFn) -> WatchdogHandle {
        watchdog::spawn(self.clone(), Some(poll))
    }

    /// Connects the push stream and feeds its events through ingestion.
    /// The connection task stops when the handle drops.
    pub fn connect_stream<T: StreamTransport>(&self, transport: T) -> StreamHandle {
        stream::spawn(transport, self.clone(), &self.inner.config)
    }

    fn publish_lock(&self) -> MutexGuard<'_, ()> {
        self.inner
            .publish_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn fan_out(&self, info: &AgentStatusInfo) {
        self.inner.status_bus.publish(info);
        let snapshot = self.inner.registry.snapshot();
        for definition in self.inner.catalog.workflows_containing(&info.agent_id) {
            self.inner
                .workflow_bus
                .publish(&aggregate(definition, &snapshot));
        }
    }
}

impl EventSink for AgentTracker {
    fn deliver(&self, event: &LifecycleEvent) {
        self.ingest(event);
    }
}
