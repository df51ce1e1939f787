//! Retry decorator for stores.
//!
//! [`ResilientStore`] wraps any [`Store`] and re-executes operations that
//! fail with an error classified as transient, sleeping between attempts
//! according to a [`RetryStrategy`]. It does not change the contract of the
//! wrapped store: every non-transient outcome passes through untouched.
//!
//! ## Replays
//!
//! A write may commit and then report a transient failure (for example a
//! dropped connection after the commit). The replay then observes the
//! post-state: a progress report or split finds its owner precondition still
//! satisfied and re-applies the same values, while a job transition finds the
//! job already moved and reports [`Error::InvalidStateTransition`]. Callers
//! treat those outcomes accordingly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use keyshard_core::{JobId, PartitionId};

use super::Store;
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::metrics::EngineMetrics;
use crate::partition::{Partition, ProgressReport};
use crate::status::StatusReport;

/// Decides how long to wait before each retry.
pub trait RetryStrategy: Send + Sync {
    /// Returns the delay before retry number `retry` (starting at 1), or
    /// `None` once retries are exhausted.
    fn delay(&self, retry: u32) -> Option<Duration>;
}

/// Classifies errors as worth retrying.
pub trait TransientErrorDetector: Send + Sync {
    /// Returns true if `error` is expected to go away on retry.
    fn is_transient(&self, error: &Error) -> bool;
}

/// Doubles the delay after every retry, up to a fixed number of retries.
///
/// The defaults (12 retries starting at 5ms) wait roughly 20 seconds in
/// total before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    retry_limit: u32,
    initial_delay: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff with `retry_limit` retries starting at `initial_delay`.
    #[must_use]
    pub const fn new(retry_limit: u32, initial_delay: Duration) -> Self {
        Self {
            retry_limit,
            initial_delay,
        }
    }

    /// Returns the configured number of retries.
    #[must_use]
    pub const fn retry_limit(&self) -> u32 {
        self.retry_limit
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from(RetryConfig::default())
    }
}

impl From<RetryConfig> for ExponentialBackoff {
    fn from(config: RetryConfig) -> Self {
        Self::new(config.retry_limit, config.initial_delay)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn delay(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.retry_limit {
            return None;
        }
        let factor = 1_u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        Some(self.initial_delay.saturating_mul(factor))
    }
}

/// Treats [`Error::Transient`] as retryable and everything else as final.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientKindDetector;

impl TransientErrorDetector for TransientKindDetector {
    fn is_transient(&self, error: &Error) -> bool {
        error.is_transient()
    }
}

/// Runs `operation` until it succeeds, fails permanently, or retries run out.
///
/// Cancellation interrupts the backoff sleep and returns [`Error::Canceled`].
///
/// # Errors
///
/// Returns the first non-transient error, the last transient error once the
/// strategy is exhausted, or [`Error::Canceled`].
pub async fn retry<T, F, Fut>(
    strategy: &dyn RetryStrategy,
    detector: &dyn TransientErrorDetector,
    operation: &'static str,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    let metrics = EngineMetrics::new();
    let mut retries = 0_u32;

    loop {
        let error = match f().await {
            Ok(value) => return Ok(value),
            Err(error) if detector.is_transient(&error) => error,
            Err(error) => return Err(error),
        };

        retries += 1;
        let Some(delay) = strategy.delay(retries) else {
            tracing::error!(operation, retries = retries - 1, %error, "store retries exhausted");
            return Err(error);
        };

        tracing::warn!(
            operation,
            retry = retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            %error,
            "transient store failure, retrying"
        );
        metrics.record_store_retry(operation);

        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Canceled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// A [`Store`] decorator that retries transient failures.
///
/// ## Example
///
/// ```rust
/// use keyshard_engine::store::memory::InMemoryStore;
/// use keyshard_engine::store::resilient::ResilientStore;
///
/// let store = ResilientStore::new(InMemoryStore::new());
/// # let _ = store;
/// ```
pub struct ResilientStore<S> {
    inner: S,
    strategy: Arc<dyn RetryStrategy>,
    detector: Arc<dyn TransientErrorDetector>,
}

impl<S: std::fmt::Debug> std::fmt::Debug for ResilientStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientStore")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<S: Store> ResilientStore<S> {
    /// Wraps `inner` with [`ExponentialBackoff::default`] and [`TransientKindDetector`].
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self::with_strategy(
            inner,
            Arc::new(ExponentialBackoff::default()),
            Arc::new(TransientKindDetector),
        )
    }

    /// Wraps `inner` with exponential backoff configured by `config`.
    #[must_use]
    pub fn from_config(inner: S, config: RetryConfig) -> Self {
        Self::with_strategy(
            inner,
            Arc::new(ExponentialBackoff::from(config)),
            Arc::new(TransientKindDetector),
        )
    }

    /// Wraps `inner` with a custom retry strategy and error classifier.
    #[must_use]
    pub fn with_strategy(
        inner: S,
        strategy: Arc<dyn RetryStrategy>,
        detector: Arc<dyn TransientErrorDetector>,
    ) -> Self {
        Self {
            inner,
            strategy,
            detector,
        }
    }

    /// Returns the wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        retry(
            self.strategy.as_ref(),
            self.detector.as_ref(),
            operation,
            cancel,
            f,
        )
        .await
    }
}

#[async_trait]
impl<S: Store> Store for ResilientStore<S> {
    async fn count_jobs(&self, cancel: &CancellationToken) -> Result<u64> {
        let inner = &self.inner;
        self.execute("count_jobs", cancel, move || inner.count_jobs(cancel))
            .await
    }

    async fn count_incomplete_partitions(
        &self,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let inner = &self.inner;
        self.execute("count_incomplete_partitions", cancel, move || {
            inner.count_incomplete_partitions(job_id, cancel)
        })
        .await
    }

    async fn insert_job(&self, job: &Job, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        self.execute("insert_job", cancel, move || inner.insert_job(job, cancel))
            .await
    }

    async fn retrieve_job(&self, id: &JobId, cancel: &CancellationToken) -> Result<Job> {
        let inner = &self.inner;
        self.execute("retrieve_job", cancel, move || inner.retrieve_job(id, cancel))
            .await
    }

    async fn mark_job_as_ready(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        let inner = &self.inner;
        self.execute("mark_job_as_ready", cancel, move || {
            inner.mark_job_as_ready(id, timestamp, cancel)
        })
        .await
    }

    async fn mark_job_as_started(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        let inner = &self.inner;
        self.execute("mark_job_as_started", cancel, move || {
            inner.mark_job_as_started(id, timestamp, cancel)
        })
        .await
    }

    async fn mark_job_as_completed(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        let inner = &self.inner;
        self.execute("mark_job_as_completed", cancel, move || {
            inner.mark_job_as_completed(id, timestamp, cancel)
        })
        .await
    }

    async fn mark_job_as_failed(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        error: &str,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        let inner = &self.inner;
        self.execute("mark_job_as_failed", cancel, move || {
            inner.mark_job_as_failed(id, timestamp, error, cancel)
        })
        .await
    }

    async fn insert_partition(
        &self,
        partition: &Partition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let inner = &self.inner;
        self.execute("insert_partition", cancel, move || {
            inner.insert_partition(partition, cancel)
        })
        .await
    }

    async fn insert_split_partition(
        &self,
        partition_to_update: &Partition,
        partition_to_insert: &Partition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let inner = &self.inner;
        self.execute("insert_split_partition", cancel, move || {
            inner.insert_split_partition(partition_to_update, partition_to_insert, cancel)
        })
        .await
    }

    async fn retrieve_partition(
        &self,
        id: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<Partition> {
        let inner = &self.inner;
        self.execute("retrieve_partition", cancel, move || {
            inner.retrieve_partition(id, cancel)
        })
        .await
    }

    async fn try_acquire_partition(
        &self,
        job_id: &JobId,
        requester: &str,
        timestamp: DateTime<Utc>,
        active: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<Partition>> {
        let inner = &self.inner;
        self.execute("try_acquire_partition", cancel, move || {
            inner.try_acquire_partition(job_id, requester, timestamp, active, cancel)
        })
        .await
    }

    async fn report_progress(
        &self,
        report: &ProgressReport,
        cancel: &CancellationToken,
    ) -> Result<Partition> {
        let inner = &self.inner;
        self.execute("report_progress", cancel, move || {
            inner.report_progress(report, cancel)
        })
        .await
    }

    async fn try_request_split(
        &self,
        job_id: &JobId,
        requester: &str,
        active: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let inner = &self.inner;
        self.execute("try_request_split", cancel, move || {
            inner.try_request_split(job_id, requester, active, cancel)
        })
        .await
    }

    async fn is_split_request_pending(
        &self,
        job_id: &JobId,
        requester: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let inner = &self.inner;
        self.execute("is_split_request_pending", cancel, move || {
            inner.is_split_request_pending(job_id, requester, cancel)
        })
        .await
    }

    async fn retrieve_job_status_report(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<StatusReport> {
        let inner = &self.inner;
        self.execute("retrieve_job_status_report", cancel, move || {
            inner.retrieve_job_status_report(id, timestamp, cancel)
        })
        .await
    }
}
