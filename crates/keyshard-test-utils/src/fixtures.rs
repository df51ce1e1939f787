//! Test fixtures and factory functions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use keyshard_core::{Clock, JobId, Range};
use keyshard_engine::config::{EngineConfig, JobSettings, RetryConfig};
use keyshard_engine::engine::Engine;
use keyshard_engine::job::Job;
use keyshard_engine::partition::Partition;
use keyshard_engine::scheduler::Scheduler;
use keyshard_engine::store::Store;
use keyshard_engine::store::memory::InMemoryStore;

use crate::simulation::SimulatedClock;
use crate::sources::SequenceDataSource;

/// Settings with a one-minute lease and two seconds of clock drift.
pub fn job_settings(batch_size: u32) -> JobSettings {
    JobSettings {
        batch_size,
        timeout: Duration::from_secs(60),
        clock_drift: Duration::from_secs(2),
    }
}

/// Engine configuration suitable for fast in-process tests.
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(5),
        idle_poll_limit: 20,
        retry: RetryConfig {
            retry_limit: 5,
            initial_delay: Duration::from_millis(1),
        },
    }
}

/// Creates an unowned partition of `job_id` over `[first, last]`.
pub fn partition(
    job_id: &JobId,
    first: &str,
    last: &str,
    remaining: u64,
    timestamp: DateTime<Utc>,
) -> Partition {
    Partition::new(
        job_id.clone(),
        Range::new(first.to_string(), last.to_string(), true),
        remaining,
        timestamp,
    )
}

/// Pre-configured test environment: an in-memory store, a simulated clock,
/// and a job identifier.
#[derive(Debug)]
pub struct TestContext {
    /// The backing store.
    pub store: Arc<InMemoryStore>,
    /// The simulated clock shared by scheduler and engines.
    pub clock: Arc<SimulatedClock>,
    /// A cancellation token that is never cancelled.
    pub cancel: CancellationToken,
    /// The job under test.
    pub job_id: JobId,
    /// Settings used when scheduling.
    pub settings: JobSettings,
}

impl TestContext {
    /// Creates a context for job `job_id` with batches of ten keys.
    pub fn new(job_id: &str) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            clock: Arc::new(SimulatedClock::deterministic()),
            cancel: CancellationToken::new(),
            job_id: JobId::new(job_id).expect("valid job id"),
            settings: job_settings(10),
        }
    }

    /// Overrides the job settings.
    #[must_use]
    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the store as a trait object.
    pub fn dyn_store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Returns the current simulated time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Inserts the job without partitions, leaving it `Initializing`.
    pub async fn insert_job(&self) -> Job {
        let job = Job::new(self.job_id.clone(), &self.settings, self.now());
        self.store
            .insert_job(&job, &self.cancel)
            .await
            .expect("insert job");
        job
    }

    /// Schedules the job over `[first, last]` with a dense `i64` key space.
    pub async fn schedule(&self, first: i64, last: i64) -> Range<i64> {
        let range = Range::new(first, last, true);
        Scheduler::with_clock(self.dyn_store(), self.clock.clone())
            .schedule(
                self.job_id.clone(),
                range.clone(),
                &self.settings,
                &SequenceDataSource::key_space(),
                &self.cancel,
            )
            .await
            .expect("schedule job");
        range
    }

    /// Creates a worker on the context's store and clock.
    pub fn engine(&self, worker_id: &str) -> Engine {
        Engine::new(self.dyn_store(), fast_engine_config())
            .with_worker_id(worker_id)
            .with_clock(self.clock.clone())
    }

    /// Returns a snapshot of the job's partitions, ordered by first key.
    pub fn partitions(&self) -> Vec<Partition> {
        self.store.partitions(&self.job_id).expect("read partitions")
    }

    /// Returns the job as currently stored.
    pub async fn job(&self) -> Job {
        self.store
            .retrieve_job(&self.job_id, &self.cancel)
            .await
            .expect("retrieve job")
    }
}
