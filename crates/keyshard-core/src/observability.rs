//! Observability infrastructure for keyshard.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors shared by the coordinator,
//! the workers, and the store implementations.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `keyshard_engine=debug`)
///
/// # Example
///
/// ```rust
/// use keyshard_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for job-level operations.
///
/// # Example
///
/// ```rust
/// use keyshard_core::observability::job_span;
///
/// let span = job_span("schedule", "nightly-reindex");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn job_span(operation: &str, job_id: &str) -> Span {
    tracing::info_span!("job", op = operation, job_id = job_id)
}

/// Creates a span for work on a single partition.
#[must_use]
pub fn partition_span(operation: &str, job_id: &str, partition_id: &str) -> Span {
    tracing::info_span!(
        "partition",
        op = operation,
        job_id = job_id,
        partition_id = partition_id,
    )
}
