//! Worker driver.
//!
//! An [`Engine`] is one worker. It repeatedly acquires a partition of a job,
//! processes it batch by batch, persists progress after every batch, and
//! fulfils split requests from idle workers. When nothing is left to acquire
//! it asks a busy worker to split, and once every partition is complete it
//! marks the job as completed.
//!
//! ## Lease Handling
//!
//! Progress reports double as heartbeats. A report that fails with
//! [`Error::LockConflict`] means another worker reclaimed the partition after
//! the lease expired; the engine drops the partition and goes back to
//! acquisition. Keys processed since the last successful report may be
//! processed again by the new owner.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use keyshard_core::JobId;
//! use keyshard_engine::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(
//! #     store: Arc<dyn Store>,
//! #     key_space: KeySpace<i64>,
//! #     processor: Arc<dyn BatchProcessor<i64>>,
//! # ) -> keyshard_engine::error::Result<()> {
//! let engine = Engine::new(store, EngineConfig::default());
//! let job_id = JobId::new("nightly-reindex")?;
//! let summary = engine
//!     .run(&job_id, &key_space, processor.as_ref(), &CancellationToken::new())
//!     .await?;
//! println!("processed {} keys", summary.keys_processed);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

use keyshard_core::observability::{job_span, partition_span};
use keyshard_core::{Clock, JobId, Range, SystemClock};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobState};
use crate::lease::{DefaultLeasePolicy, LeasePolicy};
use crate::metrics::EngineMetrics;
use crate::partition::{Partition, ProgressReport};
use crate::source::{BatchProcessor, KeySpace};
use crate::split::plan_split;
use crate::store::resilient::ResilientStore;
use crate::store::{Store, ensure_not_canceled};

/// What a worker did during one [`Engine::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// The job state the worker last observed.
    pub job_state: JobState,
    /// Partitions this worker acquired.
    pub partitions_acquired: u64,
    /// Keys this worker handed to the batch processor.
    pub keys_processed: u64,
    /// Split requests this worker fulfilled.
    pub splits_fulfilled: u64,
    /// Partitions this worker lost to another worker.
    pub leases_lost: u64,
}

impl RunSummary {
    const fn new(job_state: JobState) -> Self {
        Self {
            job_state,
            partitions_acquired: 0,
            keys_processed: 0,
            splits_fulfilled: 0,
            leases_lost: 0,
        }
    }
}

/// A worker processing partitions of a job.
pub struct Engine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    lease_policy: Arc<dyn LeasePolicy>,
    config: EngineConfig,
    worker_id: String,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates a worker with a generated identifier, the wall clock and
    /// [`DefaultLeasePolicy`].
    ///
    /// `store` is used as given; see [`Engine::resilient`] to retry transient
    /// failures with `config.retry`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            lease_policy: Arc::new(DefaultLeasePolicy),
            config,
            worker_id: format!("worker-{}", Ulid::new()),
            metrics: EngineMetrics::new(),
        }
    }

    /// Creates a worker whose store retries transient failures as
    /// configured by `config.retry`.
    #[must_use]
    pub fn resilient(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        let store: Arc<dyn Store> = Arc::new(ResilientStore::from_config(store, config.retry));
        Self::new(store, config)
    }

    /// Sets the identifier recorded as partition owner.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Sets the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the lease expiry policy.
    #[must_use]
    pub fn with_lease_policy(mut self, lease_policy: Arc<dyn LeasePolicy>) -> Self {
        self.lease_policy = lease_policy;
        self
    }

    /// Returns the identifier recorded as partition owner.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Works on `job_id` until it completes, fails, or `cancel` fires.
    ///
    /// Waits for the job to leave `Initializing` first. Returns immediately if
    /// the job is already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Processing`] after marking the job failed if the batch
    /// processor fails, [`Error::Canceled`] on cancellation, and any store or
    /// data source error that is not part of normal lease handling.
    pub async fn run<K>(
        &self,
        job_id: &JobId,
        key_space: &KeySpace<K>,
        processor: &dyn BatchProcessor<K>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary>
    where
        K: Send + Sync,
    {
        let span = job_span("run", job_id.as_str());
        async move {
            tracing::info!(worker_id = %self.worker_id, "worker started");
            let summary = self.drive(job_id, key_space, processor, cancel).await?;
            tracing::info!(
                worker_id = %self.worker_id,
                job_state = %summary.job_state,
                partitions_acquired = summary.partitions_acquired,
                keys_processed = summary.keys_processed,
                splits_fulfilled = summary.splits_fulfilled,
                "worker finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn drive<K>(
        &self,
        job_id: &JobId,
        key_space: &KeySpace<K>,
        processor: &dyn BatchProcessor<K>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary>
    where
        K: Send + Sync,
    {
        let mut job = self.wait_until_open(job_id, cancel).await?;
        let mut summary = RunSummary::new(job.state);
        if job.state.is_terminal() {
            return Ok(summary);
        }

        let mut idle_polls = 0_u32;

        loop {
            ensure_not_canceled(cancel)?;
            let now = self.clock.now();
            let active = self.lease_policy.active_threshold(now, &job);

            let acquired = self
                .store
                .try_acquire_partition(job_id, &self.worker_id, now, active, cancel)
                .await?;

            if let Some(partition) = acquired {
                idle_polls = 0;
                summary.partitions_acquired += 1;
                self.metrics.record_partition_acquired();

                if job.state == JobState::Ready {
                    job = self.mark_started(job_id, cancel).await?;
                }

                match self
                    .process_partition(&job, partition, key_space, processor, &mut summary, cancel)
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_lock_conflict() || err.is_unknown_identifier() => {
                        tracing::warn!(error = %err, "partition lost, reacquiring");
                        summary.leases_lost += 1;
                        self.metrics.record_lock_conflict();
                    }
                    Err(Error::Processing { message }) => {
                        self.mark_failed(job_id, &message, cancel).await?;
                        return Err(Error::Processing { message });
                    }
                    Err(err) => return Err(err),
                }
                continue;
            }

            if self.store.count_incomplete_partitions(job_id, cancel).await? == 0 {
                job = self.mark_completed(job_id, &job, cancel).await?;
                summary.job_state = job.state;
                return Ok(summary);
            }

            // Another worker may have failed the job in the meantime.
            job = self.store.retrieve_job(job_id, cancel).await?;
            summary.job_state = job.state;
            if job.state.is_terminal() {
                return Ok(summary);
            }

            if idle_polls < self.config.idle_poll_limit {
                idle_polls += 1;
                if self
                    .store
                    .try_request_split(job_id, &self.worker_id, active, cancel)
                    .await?
                {
                    self.metrics.record_split_request("placed");
                    tracing::debug!("split requested");
                    self.wait_for_split(job_id, cancel).await?;
                    continue;
                }
                self.metrics.record_split_request("none");
            }

            // Everything left is leased; wait for work to free up or expire.
            self.pause(cancel).await?;
        }
    }

    async fn wait_until_open(&self, job_id: &JobId, cancel: &CancellationToken) -> Result<Job> {
        loop {
            let job = self.store.retrieve_job(job_id, cancel).await?;
            if job.state != JobState::Initializing {
                return Ok(job);
            }
            tracing::debug!("job still initializing");
            self.pause(cancel).await?;
        }
    }

    /// Polls until the split request is fulfilled or the poll budget runs out.
    ///
    /// A request on a partition whose owner died is never fulfilled; the
    /// budget bounds the wait until the lease expires and the partition can be
    /// acquired instead.
    async fn wait_for_split(&self, job_id: &JobId, cancel: &CancellationToken) -> Result<()> {
        for _ in 0..self.config.idle_poll_limit {
            self.pause(cancel).await?;
            if !self
                .store
                .is_split_request_pending(job_id, &self.worker_id, cancel)
                .await?
            {
                return Ok(());
            }
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)] // Throughput is an estimate.
    async fn process_partition<K>(
        &self,
        job: &Job,
        partition: Partition,
        key_space: &KeySpace<K>,
        processor: &dyn BatchProcessor<K>,
        summary: &mut RunSummary,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        K: Send + Sync,
    {
        let span = partition_span(
            "process",
            job.id.as_str(),
            &partition.id.to_string(),
        );

        async move {
            let serializer = key_space.serializer.as_ref();
            let mut current = partition;
            let mut range = deserialize_range(&current, key_space)?;
            let mut position = current
                .position
                .as_deref()
                .map(|key| serializer.deserialize(key))
                .transpose()?;

            tracing::debug!(
                first = %current.first,
                last = %current.last,
                position = ?current.position,
                "partition acquired"
            );

            let mut release_split = false;

            loop {
                ensure_not_canceled(cancel)?;
                let batch = key_space
                    .source
                    .next_batch(&range, position.as_ref(), job.batch_size, cancel)
                    .await?;

                let started = Instant::now();
                if !batch.is_empty() {
                    processor
                        .process(&batch, cancel)
                        .await
                        .map_err(|err| match err {
                            Error::Canceled | Error::Processing { .. } => err,
                            other => Error::processing(other.to_string()),
                        })?;
                }
                let elapsed = started.elapsed();

                let count = u64::try_from(batch.len()).unwrap_or(u64::MAX);
                // A short batch means the source ran out of keys in this range.
                let completed = count < u64::from(job.batch_size);
                if let Some(last) = batch.into_iter().next_back() {
                    position = Some(last);
                }
                let throughput = if elapsed.as_secs_f64() > 0.0 {
                    count as f64 / elapsed.as_secs_f64()
                } else {
                    count as f64
                };

                let report = ProgressReport {
                    id: current.id,
                    owner: self.worker_id.clone(),
                    timestamp: self.clock.now(),
                    position: match &position {
                        Some(key) => serializer.serialize(key)?,
                        None => current.position.clone().unwrap_or_else(|| current.first.clone()),
                    },
                    processed: current.processed.saturating_add(count),
                    remaining: current.remaining.saturating_sub(count),
                    completed,
                    throughput,
                    release_split_request: release_split,
                };
                current = self.store.report_progress(&report, cancel).await?;
                release_split = false;

                summary.keys_processed += count;
                self.metrics.observe_batch(count, elapsed);

                if completed {
                    tracing::debug!(processed = current.processed, "partition completed");
                    return Ok(());
                }

                if current.split_requester.is_some() {
                    match self.fulfil_split(&current, key_space, cancel).await? {
                        Some(shrunk) => {
                            current = shrunk;
                            range = deserialize_range(&current, key_space)?;
                            summary.splits_fulfilled += 1;
                        }
                        // Released with the next report so the requester stops waiting.
                        None => release_split = true,
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Splits `partition` for a waiting worker, returning the shrunk partition.
    async fn fulfil_split<K>(
        &self,
        partition: &Partition,
        key_space: &KeySpace<K>,
        cancel: &CancellationToken,
    ) -> Result<Option<Partition>>
    where
        K: Send + Sync,
    {
        let plan = plan_split(
            partition,
            key_space.arithmetics.as_ref(),
            key_space.serializer.as_ref(),
            key_space.source.as_ref(),
            self.clock.now(),
            cancel,
        )
        .await?;

        let Some(plan) = plan else {
            tracing::debug!(
                requester = ?partition.split_requester,
                "partition too small to split"
            );
            self.metrics.record_split("unsplittable");
            return Ok(None);
        };

        self.store
            .insert_split_partition(&plan.update, &plan.insert, cancel)
            .await?;
        self.metrics.record_split("executed");
        tracing::info!(
            requester = ?partition.split_requester,
            new_partition_id = %plan.insert.id,
            split_key = %plan.insert.first,
            "split fulfilled"
        );
        Ok(Some(plan.update))
    }

    async fn mark_started(&self, job_id: &JobId, cancel: &CancellationToken) -> Result<Job> {
        match self
            .store
            .mark_job_as_started(job_id, self.clock.now(), cancel)
            .await
        {
            Ok(job) => {
                self.metrics.record_job_transition(&job.state.to_string());
                tracing::info!("job started");
                Ok(job)
            }
            // Another worker got there first.
            Err(Error::InvalidStateTransition { .. }) => {
                self.store.retrieve_job(job_id, cancel).await
            }
            Err(err) => Err(err),
        }
    }

    async fn mark_completed(
        &self,
        job_id: &JobId,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        if job.state == JobState::Ready {
            self.mark_started(job_id, cancel).await?;
        }
        match self
            .store
            .mark_job_as_completed(job_id, self.clock.now(), cancel)
            .await
        {
            Ok(job) => {
                self.metrics.record_job_transition(&job.state.to_string());
                tracing::info!("job completed");
                Ok(job)
            }
            Err(Error::InvalidStateTransition { .. }) => {
                self.store.retrieve_job(job_id, cancel).await
            }
            Err(err) => Err(err),
        }
    }

    async fn mark_failed(
        &self,
        job_id: &JobId,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        tracing::error!(error = message, "batch processing failed, failing job");
        match self
            .store
            .mark_job_as_failed(job_id, self.clock.now(), message, cancel)
            .await
        {
            Ok(job) => {
                self.metrics.record_job_transition(&job.state.to_string());
                Ok(job)
            }
            Err(Error::InvalidStateTransition { .. }) => {
                self.store.retrieve_job(job_id, cancel).await
            }
            Err(err) => Err(err),
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Canceled),
            () = tokio::time::sleep(self.config.poll_interval) => Ok(()),
        }
    }
}

fn deserialize_range<K>(partition: &Partition, key_space: &KeySpace<K>) -> Result<Range<K>> {
    Ok(partition
        .range()
        .try_map(|key| key_space.serializer.deserialize(key))?)
}
