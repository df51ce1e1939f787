//! Metrics for the coordination engine.
//!
//! Metrics are emitted through the `metrics` crate facade; install any
//! recorder (for example a Prometheus exporter) to collect them.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `keyshard_store_retries_total` | Counter | `operation` | Store calls retried after a transient failure |
//! | `keyshard_partitions_acquired_total` | Counter | - | Partitions handed to a worker |
//! | `keyshard_split_requests_total` | Counter | `result` | Split requests by outcome |
//! | `keyshard_splits_total` | Counter | `result` | Split executions by outcome |
//! | `keyshard_keys_processed_total` | Counter | - | Keys passed to batch processors |
//! | `keyshard_batch_duration_seconds` | Histogram | - | Batch processing time |
//! | `keyshard_lock_conflicts_total` | Counter | - | Leases lost to another worker |
//! | `keyshard_job_transitions_total` | Counter | `to_state` | Job state transitions |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keyshard_engine::metrics::EngineMetrics;
//!
//! let metrics = EngineMetrics::new();
//! metrics.record_partition_acquired();
//! metrics.record_split("executed");
//! ```

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Store calls retried after a transient failure.
    pub const STORE_RETRIES_TOTAL: &str = "keyshard_store_retries_total";
    /// Counter: Partitions handed to a worker.
    pub const PARTITIONS_ACQUIRED_TOTAL: &str = "keyshard_partitions_acquired_total";
    /// Counter: Split requests by outcome.
    pub const SPLIT_REQUESTS_TOTAL: &str = "keyshard_split_requests_total";
    /// Counter: Split executions by outcome.
    pub const SPLITS_TOTAL: &str = "keyshard_splits_total";
    /// Counter: Keys passed to batch processors.
    pub const KEYS_PROCESSED_TOTAL: &str = "keyshard_keys_processed_total";
    /// Histogram: Batch processing time in seconds.
    pub const BATCH_DURATION_SECONDS: &str = "keyshard_batch_duration_seconds";
    /// Counter: Leases lost to another worker.
    pub const LOCK_CONFLICTS_TOTAL: &str = "keyshard_lock_conflicts_total";
    /// Counter: Job state transitions.
    pub const JOB_TRANSITIONS_TOTAL: &str = "keyshard_job_transitions_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Store operation name.
    pub const OPERATION: &str = "operation";
    /// Outcome (placed, none, executed, unsplittable, conflict).
    pub const RESULT: &str = "result";
    /// Target job state.
    pub const TO_STATE: &str = "to_state";
}

/// High-level interface for recording engine metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a retried store call.
    pub fn record_store_retry(&self, operation: &'static str) {
        counter!(names::STORE_RETRIES_TOTAL, labels::OPERATION => operation).increment(1);
    }

    /// Records a successful partition acquisition.
    pub fn record_partition_acquired(&self) {
        counter!(names::PARTITIONS_ACQUIRED_TOTAL).increment(1);
    }

    /// Records the outcome of a split request.
    pub fn record_split_request(&self, result: &'static str) {
        counter!(names::SPLIT_REQUESTS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records the outcome of a split execution.
    pub fn record_split(&self, result: &'static str) {
        counter!(names::SPLITS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records one processed batch.
    pub fn observe_batch(&self, keys: u64, duration: Duration) {
        counter!(names::KEYS_PROCESSED_TOTAL).increment(keys);
        histogram!(names::BATCH_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records a lost lease.
    pub fn record_lock_conflict(&self) {
        counter!(names::LOCK_CONFLICTS_TOTAL).increment(1);
    }

    /// Records a job state transition.
    pub fn record_job_transition(&self, to_state: &str) {
        counter!(names::JOB_TRANSITIONS_TOTAL, labels::TO_STATE => to_state.to_string())
            .increment(1);
    }
}
