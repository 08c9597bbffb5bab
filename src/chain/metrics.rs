//! Prometheus metrics for batch execution
//!
//! Series are labelled with the batch's configured label so different call
//! sites can be told apart.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Counter for finished batches
    static ref BATCHES: IntCounterVec = register_int_counter_vec!(
        "modelchain_batches_total",
        "Total number of batches that reached completion",
        &["label", "status"]
    ).expect("batch counter registers once");

    /// Counter for operation outcomes
    static ref OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "modelchain_operations_total",
        "Total number of operations by outcome",
        &["label", "outcome"]
    ).expect("operation counter registers once");

    /// Histogram for batch duration
    static ref BATCH_DURATION: HistogramVec = register_histogram_vec!(
        "modelchain_batch_duration_seconds",
        "Time from run to final handler in seconds",
        &["label"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).expect("duration histogram registers once");

    /// Gauge for batches still waiting on completions
    static ref ACTIVE_BATCHES: IntGauge = register_int_gauge!(
        "modelchain_active_batches",
        "Number of batches currently running"
    ).expect("active gauge registers once");
}

/// Operation outcome label values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed without error
    Ok,
    /// Completed with an error
    Error,
    /// Dropped before dispatch
    SetupFault,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Error => "error",
            Outcome::SetupFault => "setup_fault",
        }
    }
}

/// Metrics recorder bound to one batch label
#[derive(Debug, Clone)]
pub struct ChainMetrics {
    label: String,
    enabled: bool,
}

impl ChainMetrics {
    /// Create a recorder; a disabled recorder is a no-op
    pub fn new(label: impl Into<String>, enabled: bool) -> Self {
        Self {
            label: label.into(),
            enabled,
        }
    }

    /// Record a batch starting to wait on completions
    pub fn batch_started(&self) {
        if self.enabled {
            ACTIVE_BATCHES.inc();
        }
    }

    /// Record a batch reaching completion
    pub fn batch_finished(&self, failed: bool, duration_secs: f64, was_active: bool) {
        if !self.enabled {
            return;
        }
        if was_active {
            ACTIVE_BATCHES.dec();
        }
        let status = if failed { "partial_failure" } else { "success" };
        BATCHES.with_label_values(&[&self.label, status]).inc();
        BATCH_DURATION
            .with_label_values(&[&self.label])
            .observe(duration_secs);
    }

    /// Record one operation outcome
    pub fn operation(&self, outcome: Outcome) {
        if self.enabled {
            OPERATIONS
                .with_label_values(&[&self.label, outcome.as_str()])
                .inc();
        }
    }
}

/// Count of recorded operations for a label and outcome
pub fn operation_count(label: &str, outcome: Outcome) -> u64 {
    OPERATIONS.with_label_values(&[label, outcome.as_str()]).get()
}

/// Render all registered metrics in the Prometheus text format
pub fn export() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
