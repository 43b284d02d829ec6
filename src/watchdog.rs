//! Periodic refresh and timeout promotion.
//!
//! Push streams fail silently: an agent that crashes mid-run simply stops
//! reporting, and no event ever says so. The watchdog closes that gap.
//! On every tick it runs the optional poll function (reconciling missed
//! events through the normal ingestion path) and then promotes any agent
//! that has been `starting` or `running` past its timeout threshold.

use crate::catalog::WorkflowSequenceCatalog;
use crate::config::TrackerConfig;
use crate::ingest::LifecycleEvent;
use crate::status::AgentStatus;
use crate::AgentTracker;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Fetches the current lifecycle events from the agent runtime. Called
/// once per tick; an empty vec means nothing to reconcile.
pub type PollFn = Arc<dyn Fn() -> BoxFuture<'static, Vec<LifecycleEvent>> + Send + Sync>;

/// Keeps the watchdog task alive; dropping it stops the task.
pub struct WatchdogHandle {
    _stop_tx: mpsc::Sender<()>,
}

impl WatchdogHandle {
    /// Stops the watchdog task explicitly.
    pub fn shutdown(self) {}
}

pub(crate) fn spawn(tracker: AgentTracker, poll: Option<PollFn>) -> WatchdogHandle {
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let period = tracker.config().refresh_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(poll) = &poll {
                        for event in poll().await {
                            tracker.ingest(&event);
                        }
                    }
                    scan_for_timeouts(&tracker, Utc::now());
                }
                _ = stop_rx.recv() => return,
            }
        }
    });
    WatchdogHandle { _stop_tx: stop_tx }
}

/// Promotes every silent in-flight agent whose run has outlived its
/// threshold. Goes through the tracker's normal apply path so observers
/// see the promotion like any other transition.
pub(crate) fn scan_for_timeouts(tracker: &AgentTracker, now: DateTime<Utc>) {
    for info in tracker.latest_agent_statuses().values() {
        if !matches!(info.status, AgentStatus::Starting | AgentStatus::Running) {
            continue;
        }
        let threshold = timeout_threshold(tracker.catalog(), tracker.config(), &info.agent_id);
        let elapsed = now - info.execution_start;
        if elapsed <= threshold {
            continue;
        }
        tracing::warn!(
            agent_id = %info.agent_id,
            elapsed_secs = elapsed.num_seconds(),
            limit_secs = threshold.num_seconds(),
            "promoting silent agent to timeout"
        );
        let mut candidate = info.clone();
        candidate.status = AgentStatus::Timeout;
        candidate.observed_at = now;
        candidate.error_message = Some(format!(
            "no status report for {}s (limit {}s)",
            elapsed.num_seconds(),
            threshold.num_seconds()
        ));
        tracker.apply(candidate);
    }
}

/// Estimated step duration times the configured multiplier; the flat
/// default for agents outside every catalog workflow.
fn timeout_threshold(
    catalog: &WorkflowSequenceCatalog,
    config: &TrackerConfig,
    agent_id: &str,
) -> chrono::Duration {
    let estimated = catalog
        .workflows_containing(agent_id)
        .filter_map(|w| w.step_duration(agent_id))
        .next();
    match estimated {
        Some(duration) => {
            let secs = duration.num_seconds() as f64 * config.timeout_multiplier;
            chrono::Duration::seconds(secs.max(0.0) as i64)
        }
        None => config.default_timeout(),
    }
}
