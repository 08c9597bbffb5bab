//! Batch configuration

use serde::{Deserialize, Serialize};

/// How resolved invocations are driven once a batch runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DispatchMode {
    /// One Tokio task per operation
    #[default]
    Spawn,
    /// All operations polled from a single task
    Cooperative,
}

/// Batch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Label attached to log fields and metric series
    pub label: String,
    /// Dispatch strategy
    pub dispatch: DispatchMode,
    /// Whether to record Prometheus metrics
    pub record_metrics: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            label: "chain".to_string(),
            dispatch: DispatchMode::Spawn,
            record_metrics: true,
        }
    }
}

impl ChainConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the dispatch mode
    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Enable or disable metrics
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.record_metrics = enabled;
        self
    }
}
