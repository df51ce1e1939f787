//! Deterministic simulation tools for distributed scenarios.
//!
//! # Key Features
//!
//! - **Clock Control**: [`SimulatedClock`] only moves when a test advances it,
//!   so lease expiry can be exercised without sleeping
//! - **Fault Injection**: [`FaultInjectingStore`] wraps any store and fails
//!   calls with transient errors, either scripted or drawn from a seeded RNG
//! - **Ambiguous Commits**: Faults can be injected *after* the wrapped call
//!   committed, which is what makes retries dangerous in the first place
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use keyshard_engine::store::memory::InMemoryStore;
//! use keyshard_test_utils::simulation::{FaultInjectingStore, FaultMode};
//!
//! let store = FaultInjectingStore::new(Arc::new(InMemoryStore::new()), 7);
//! store.fail_next(FaultMode::AfterCommit);
//! // The next call commits, then reports a transient failure.
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use keyshard_core::{Clock, JobId, PartitionId};
use keyshard_engine::error::{Error, Result};
use keyshard_engine::job::Job;
use keyshard_engine::partition::{Partition, ProgressReport};
use keyshard_engine::status::StatusReport;
use keyshard_engine::store::Store;

/// Simulated clock for deterministic time control.
#[derive(Debug)]
pub struct SimulatedClock {
    /// Base time (start of simulation).
    base: DateTime<Utc>,
    /// Elapsed milliseconds since base.
    elapsed_ms: AtomicU64,
}

impl SimulatedClock {
    /// Creates a new simulated clock starting at the given time.
    #[must_use]
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_ms: AtomicU64::new(0),
        }
    }

    /// Creates a clock anchored at a fixed instant.
    #[must_use]
    pub fn deterministic() -> Self {
        let base = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp");
        Self::new(base)
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).expect("duration fits in u64");
        self.elapsed_ms.fetch_add(millis, Ordering::Relaxed);
    }

    /// Returns elapsed time since simulation start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::Relaxed))
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = i64::try_from(self.elapsed_ms.load(Ordering::Relaxed))
            .expect("elapsed fits in i64");
        self.base + chrono::Duration::milliseconds(elapsed)
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::deterministic()
    }
}

/// Where an injected fault strikes relative to the wrapped call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// The call never reaches the wrapped store.
    BeforeCommit,
    /// The wrapped call runs to completion, then the result is replaced by a
    /// transient error.
    AfterCommit,
}

/// Configuration for random fault injection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultConfig {
    /// Probability that a call fails before reaching the store (0.0 - 1.0).
    pub before_commit_rate: f64,
    /// Probability that a call fails after the store committed (0.0 - 1.0).
    pub after_commit_rate: f64,
}

impl FaultConfig {
    /// Creates a config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Creates a config simulating a flaky connection.
    #[must_use]
    pub fn flaky() -> Self {
        Self {
            before_commit_rate: 0.1,
            after_commit_rate: 0.05,
        }
    }
}

/// A store decorator that injects transient failures.
///
/// Scripted faults queued with [`fail_next`](Self::fail_next) or
/// [`fail_next_on`](Self::fail_next_on) take precedence over random ones.
pub struct FaultInjectingStore {
    inner: Arc<dyn Store>,
    rng: Mutex<StdRng>,
    config: Mutex<FaultConfig>,
    scripted: Mutex<VecDeque<FaultMode>>,
    targeted: Mutex<Vec<(&'static str, FaultMode)>>,
    injected: AtomicU64,
}

impl FaultInjectingStore {
    /// Wraps `inner`, seeding the fault RNG with `seed`. No faults are
    /// configured initially.
    #[must_use]
    pub fn new(inner: Arc<dyn Store>, seed: u64) -> Self {
        Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            config: Mutex::new(FaultConfig::no_faults()),
            scripted: Mutex::new(VecDeque::new()),
            targeted: Mutex::new(Vec::new()),
            injected: AtomicU64::new(0),
        }
    }

    /// Replaces the random fault configuration.
    pub fn configure_faults(&self, config: FaultConfig) {
        *self.config.lock().unwrap() = config;
    }

    /// Queues a fault for the next call.
    pub fn fail_next(&self, mode: FaultMode) {
        self.scripted.lock().unwrap().push_back(mode);
    }

    /// Queues a fault for the next call of `operation`, named after the
    /// store method (for example `"insert_job"`). Other calls pass through.
    pub fn fail_next_on(&self, operation: &'static str, mode: FaultMode) {
        self.targeted.lock().unwrap().push((operation, mode));
    }

    /// Returns the number of faults injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    fn draw(&self, operation: &str) -> Option<FaultMode> {
        {
            let mut targeted = self.targeted.lock().unwrap();
            if let Some(index) = targeted.iter().position(|(op, _)| *op == operation) {
                return Some(targeted.remove(index).1);
            }
        }
        if let Some(mode) = self.scripted.lock().unwrap().pop_front() {
            return Some(mode);
        }
        let config = *self.config.lock().unwrap();
        let roll: f64 = self.rng.lock().unwrap().r#gen();
        if roll < config.before_commit_rate {
            Some(FaultMode::BeforeCommit)
        } else if roll < config.before_commit_rate + config.after_commit_rate {
            Some(FaultMode::AfterCommit)
        } else {
            None
        }
    }

    async fn inject<T, Fut>(&self, operation: &'static str, call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        match self.draw(operation) {
            None => call.await,
            Some(FaultMode::BeforeCommit) => {
                self.injected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(operation, "injecting fault before commit");
                Err(Error::transient(format!("injected fault before {operation}")))
            }
            Some(FaultMode::AfterCommit) => {
                call.await?;
                self.injected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(operation, "injecting fault after commit");
                Err(Error::transient(format!("injected fault after {operation}")))
            }
        }
    }
}

impl std::fmt::Debug for FaultInjectingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjectingStore")
            .field("injected", &self.injected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for FaultInjectingStore {
    async fn count_jobs(&self, cancel: &CancellationToken) -> Result<u64> {
        self.inject("count_jobs", self.inner.count_jobs(cancel)).await
    }

    async fn count_incomplete_partitions(
        &self,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.inject(
            "count_incomplete_partitions",
            self.inner.count_incomplete_partitions(job_id, cancel),
        )
        .await
    }

    async fn insert_job(&self, job: &Job, cancel: &CancellationToken) -> Result<()> {
        self.inject("insert_job", self.inner.insert_job(job, cancel)).await
    }

    async fn retrieve_job(&self, id: &JobId, cancel: &CancellationToken) -> Result<Job> {
        self.inject("retrieve_job", self.inner.retrieve_job(id, cancel)).await
    }

    async fn mark_job_as_ready(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        self.inject(
            "mark_job_as_ready",
            self.inner.mark_job_as_ready(id, timestamp, cancel),
        )
        .await
    }

    async fn mark_job_as_started(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        self.inject(
            "mark_job_as_started",
            self.inner.mark_job_as_started(id, timestamp, cancel),
        )
        .await
    }

    async fn mark_job_as_completed(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        self.inject(
            "mark_job_as_completed",
            self.inner.mark_job_as_completed(id, timestamp, cancel),
        )
        .await
    }

    async fn mark_job_as_failed(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        error: &str,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        self.inject(
            "mark_job_as_failed",
            self.inner.mark_job_as_failed(id, timestamp, error, cancel),
        )
        .await
    }

    async fn insert_partition(
        &self,
        partition: &Partition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inject(
            "insert_partition",
            self.inner.insert_partition(partition, cancel),
        )
        .await
    }

    async fn insert_split_partition(
        &self,
        partition_to_update: &Partition,
        partition_to_insert: &Partition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inject(
            "insert_split_partition",
            self.inner
                .insert_split_partition(partition_to_update, partition_to_insert, cancel),
        )
        .await
    }

    async fn retrieve_partition(
        &self,
        id: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<Partition> {
        self.inject("retrieve_partition", self.inner.retrieve_partition(id, cancel))
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
        self.inject(
            "try_acquire_partition",
            self.inner
                .try_acquire_partition(job_id, requester, timestamp, active, cancel),
        )
        .await
    }

    async fn report_progress(
        &self,
        report: &ProgressReport,
        cancel: &CancellationToken,
    ) -> Result<Partition> {
        self.inject("report_progress", self.inner.report_progress(report, cancel))
            .await
    }

    async fn try_request_split(
        &self,
        job_id: &JobId,
        requester: &str,
        active: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.inject(
            "try_request_split",
            self.inner.try_request_split(job_id, requester, active, cancel),
        )
        .await
    }

    async fn is_split_request_pending(
        &self,
        job_id: &JobId,
        requester: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.inject(
            "is_split_request_pending",
            self.inner.is_split_request_pending(job_id, requester, cancel),
        )
        .await
    }

    async fn retrieve_job_status_report(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<StatusReport> {
        self.inject(
            "retrieve_job_status_report",
            self.inner.retrieve_job_status_report(id, timestamp, cancel),
        )
        .await
    }
}
