//! Tracker configuration.
//!
//! Every field has a default so an empty document (or `Default::default()`)
//! yields a working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerConfig {
    /// Cadence of the periodic refresh: watchdog scan plus optional poll.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// An agent is promoted to `timeout` once it has been running for its
    /// estimated duration times this multiplier without reporting.
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,
    /// Watchdog threshold for agents that appear in no catalog workflow.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Capacity of the webhook event ring buffer.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Capacity of the ingestion dedup window.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// First reconnect delay; doubles per attempt.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// When set, events for agents outside the catalog are dropped.
    #[serde(default)]
    pub strict_agent_ids: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            timeout_multiplier: default_timeout_multiplier(),
            default_timeout_secs: default_timeout_secs(),
            max_events: default_max_events(),
            dedup_capacity: default_dedup_capacity(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            strict_agent_ids: false,
        }
    }
}

impl TrackerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn default_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.default_timeout_secs).unwrap_or(i64::MAX))
    }
}

fn default_refresh_interval_secs() -> u64 {
    5
}

fn default_timeout_multiplier() -> f64 {
    3.0
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_events() -> usize {
    50
}

fn default_dedup_capacity() -> usize {
    1024
}

fn default_backoff_base_secs() -> u64 {
    1
}

fn default_backoff_max_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: TrackerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.refresh_interval_secs, 5);
        assert_eq!(config.max_events, 50);
        assert!(!config.strict_agent_ids);
        assert_eq!(config.refresh_interval(), Duration::from_secs(5));
    }

    #[test]
    fn partial_document_overrides_selectively() {
        let config: TrackerConfig =
            serde_yaml::from_str("max_events: 10\nstrict_agent_ids: true").unwrap();
        assert_eq!(config.max_events, 10);
        assert!(config.strict_agent_ids);
        assert_eq!(config.backoff_max_secs, 60);
    }
}
