//! Job scheduling.
//!
//! The scheduler creates a job and its initial partition spanning the whole
//! key range, then opens the job to workers. Workers never create jobs; they
//! only find them in the store.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use keyshard_core::observability::job_span;
use keyshard_core::{Clock, JobId, Range, SystemClock};

use crate::config::JobSettings;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::metrics::EngineMetrics;
use crate::partition::Partition;
use crate::source::KeySpace;
use crate::store::Store;

/// Creates jobs and their initial partitions.
pub struct Scheduler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler backed by `store` using the wall clock.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Creates a scheduler with a custom time source.
    #[must_use]
    pub fn with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            metrics: EngineMetrics::new(),
        }
    }

    /// Schedules a job over `range` and marks it ready for workers.
    ///
    /// The job is inserted as `Initializing`, the range size is estimated with
    /// the key space's data source, a single partition covering the range is
    /// inserted, and finally the job moves to `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`keyshard_core::Error::InvalidInput`] for invalid settings or
    /// an empty or descending range, [`Error::DuplicateIdentifier`] if the job
    /// already exists, and any store or data source failure.
    pub async fn schedule<K>(
        &self,
        job_id: JobId,
        range: Range<K>,
        settings: &JobSettings,
        key_space: &KeySpace<K>,
        cancel: &CancellationToken,
    ) -> Result<Job>
    where
        K: Send + Sync,
    {
        let span = job_span("schedule", job_id.as_str());
        async move {
            settings.validate()?;
            if !range.is_ascending(|a, b| key_space.arithmetics.compare(a, b)) {
                return Err(Error::Core(keyshard_core::Error::InvalidInput(
                    "key range is empty or descending".into(),
                )));
            }
            let stored_range = range.try_map(|key| key_space.serializer.serialize(key))?;

            let job = Job::new(job_id.clone(), settings, self.clock.now());
            self.insert_job(&job, cancel).await?;

            let remaining = key_space.source.estimate_range_size(&range, cancel).await?;
            let partition = Partition::new(
                job_id.clone(),
                stored_range,
                remaining.max(1),
                self.clock.now(),
            );
            self.insert_partition(&partition, cancel).await?;

            let job = self.mark_ready(&job_id, cancel).await?;

            tracing::info!(
                partition_id = %partition.id,
                remaining,
                batch_size = job.batch_size,
                "job scheduled"
            );
            Ok(job)
        }
        .instrument(span)
        .await
    }

    /// Inserts `job`, treating a stored copy of the very same job as a replay
    /// of an insert that committed before its acknowledgement was lost.
    async fn insert_job(&self, job: &Job, cancel: &CancellationToken) -> Result<()> {
        match self.store.insert_job(job, cancel).await {
            Err(err @ Error::DuplicateIdentifier { .. }) => {
                if self.store.retrieve_job(&job.id, cancel).await? == *job {
                    tracing::debug!("job insert already applied");
                    Ok(())
                } else {
                    Err(err)
                }
            }
            result => result,
        }
    }

    async fn insert_partition(
        &self,
        partition: &Partition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.store.insert_partition(partition, cancel).await {
            Err(err @ Error::DuplicateIdentifier { .. }) => {
                if self.store.retrieve_partition(partition.id, cancel).await? == *partition {
                    tracing::debug!("partition insert already applied");
                    Ok(())
                } else {
                    Err(err)
                }
            }
            result => result,
        }
    }

    async fn mark_ready(&self, job_id: &JobId, cancel: &CancellationToken) -> Result<Job> {
        match self
            .store
            .mark_job_as_ready(job_id, self.clock.now(), cancel)
            .await
        {
            Ok(job) => {
                self.metrics.record_job_transition(&job.state.to_string());
                Ok(job)
            }
            // Workers may already have picked the job up.
            Err(err @ Error::InvalidStateTransition { .. }) => {
                let job = self.store.retrieve_job(job_id, cancel).await?;
                if job.state.accepts_workers() {
                    tracing::debug!(state = %job.state, "job already open");
                    Ok(job)
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }
}
