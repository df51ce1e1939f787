//! Pluggable storage for coordination state.
//!
//! The [`Store`] trait is the only channel through which workers coordinate:
//! there is no shared memory and no RPC between them. Every implementation
//! must make each operation atomic from the caller's perspective.
//!
//! ## Design Principles
//!
//! - **Conditional writes**: Every mutation is conditioned on a precise
//!   pre-state (job id, partition owner, lifecycle state). A replayed write that
//!   already succeeded finds its precondition gone and reports it, instead of
//!   applying twice.
//! - **Expected outcomes are values**: "nothing eligible" from acquisition or a
//!   split request is `Ok(None)` / `Ok(false)`, not an error.
//! - **Decoration**: [`resilient::ResilientStore`] wraps any implementation
//!   with retries for transient failures without changing the contract.
//! - **Testability**: [`memory::InMemoryStore`] is the reference implementation.

pub mod memory;
pub mod resilient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use keyshard_core::{JobId, PartitionId};

use crate::error::{Error, Result};
use crate::job::Job;
use crate::partition::{Partition, ProgressReport};
use crate::status::StatusReport;

/// Storage abstraction for jobs and partitions.
///
/// Implementations must provide:
/// - A `jobs` collection keyed by job id
/// - A `partitions` collection keyed by partition id, with lookup by job id and
///   referential integrity to `jobs`
/// - At least read-committed isolation, with read-then-write operations
///   (acquisition, split request, split, progress report) executed atomically
///
/// ## Cancellation
///
/// Every operation takes a [`CancellationToken`]. An operation that observes
/// cancellation returns [`Error::Canceled`] and must not leave a partial
/// mutation visible to other callers.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from many
/// worker tasks.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Counting ---

    /// Returns the number of jobs.
    async fn count_jobs(&self, cancel: &CancellationToken) -> Result<u64>;

    /// Returns the number of partitions of `job_id` that are not completed.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownIdentifier`] if the job does not exist.
    async fn count_incomplete_partitions(
        &self,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    // --- Jobs ---

    /// Inserts a new job.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateIdentifier`] if a job with the same id exists.
    async fn insert_job(&self, job: &Job, cancel: &CancellationToken) -> Result<()>;

    /// Retrieves a job.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownIdentifier`] if the job does not exist.
    async fn retrieve_job(&self, id: &JobId, cancel: &CancellationToken) -> Result<Job>;

    /// Moves a job from `Initializing` to `Ready`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownIdentifier`] if the job does not exist;
    /// [`Error::InvalidStateTransition`] if it is not `Initializing`.
    async fn mark_job_as_ready(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job>;

    /// Moves a job from `Ready` to `Processing` and records `started`.
    ///
    /// # Errors
    ///
    /// As [`mark_job_as_ready`](Self::mark_job_as_ready).
    async fn mark_job_as_started(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job>;

    /// Moves a job from `Processing` to `Completed` and records `completed`.
    ///
    /// # Errors
    ///
    /// As [`mark_job_as_ready`](Self::mark_job_as_ready).
    async fn mark_job_as_completed(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job>;

    /// Moves a non-terminal job to `Failed`, recording `completed` and `error`.
    ///
    /// # Errors
    ///
    /// As [`mark_job_as_ready`](Self::mark_job_as_ready).
    async fn mark_job_as_failed(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        error: &str,
        cancel: &CancellationToken,
    ) -> Result<Job>;

    // --- Partitions ---

    /// Inserts a new partition.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidReference`] if the job does not exist;
    /// [`Error::DuplicateIdentifier`] if the partition id is taken.
    async fn insert_partition(
        &self,
        partition: &Partition,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Atomically shrinks `partition_to_update` and inserts `partition_to_insert`.
    ///
    /// The update is conditioned on `partition_to_update.owner` still holding
    /// the lease. It writes the range end, counters, throughput and clears
    /// any split request. Either both changes commit or neither does. A replay
    /// of a split that already committed is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownIdentifier`] if the partition to update vanished;
    /// [`Error::LockConflict`] if its owner changed;
    /// [`Error::DuplicateIdentifier`] / [`Error::InvalidReference`] as for
    /// [`insert_partition`](Self::insert_partition).
    async fn insert_split_partition(
        &self,
        partition_to_update: &Partition,
        partition_to_insert: &Partition,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Retrieves a partition.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownIdentifier`] if the partition does not exist.
    async fn retrieve_partition(
        &self,
        id: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<Partition>;

    /// Hands a partition of `job_id` to `requester`.
    ///
    /// Eligible partitions are incomplete and either unowned or last updated
    /// before `active`. Among them, the one with the most `remaining` keys is
    /// chosen; its `owner` becomes `requester` and `updated` becomes
    /// `timestamp`. Returns `None` if nothing is eligible.
    ///
    /// ## Holder Renewal
    ///
    /// Beyond plain eligibility, an incomplete partition already owned by
    /// `requester` is returned in preference to any other, with its `updated`
    /// refreshed to `timestamp`. A second call by the holder therefore renews
    /// its lease and returns the same partition instead of `None`; a call by
    /// any other worker still finds the live partition ineligible. This makes
    /// an acquisition replayed after a lost acknowledgement land on the
    /// partition it already committed.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownIdentifier`] if the job does not exist.
    async fn try_acquire_partition(
        &self,
        job_id: &JobId,
        requester: &str,
        timestamp: DateTime<Utc>,
        active: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<Partition>>;

    /// Persists progress, conditioned on `report.owner` holding the lease.
    ///
    /// Clears the split request when `report.completed` or
    /// `report.release_split_request` is set.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownIdentifier`] if the partition does not exist;
    /// [`Error::LockConflict`] if it is owned by someone else.
    async fn report_progress(
        &self,
        report: &ProgressReport,
        cancel: &CancellationToken,
    ) -> Result<Partition>;

    /// Asks for an actively leased partition of `job_id` to be split.
    ///
    /// Marks one owned, incomplete partition updated at or after `active` that
    /// has no pending request with `split_requester = requester`. Returns
    /// whether a partition was marked.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownIdentifier`] if the job does not exist.
    async fn try_request_split(
        &self,
        job_id: &JobId,
        requester: &str,
        active: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Returns whether a split request from `requester` is still outstanding.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownIdentifier`] if the job does not exist.
    async fn is_split_request_pending(
        &self,
        job_id: &JobId,
        requester: &str,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Computes a progress report for a job as of `timestamp`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownIdentifier`] if the job does not exist.
    async fn retrieve_job_status_report(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<StatusReport>;
}

/// Shares one store between owners, for example to wrap an `Arc<dyn Store>`
/// in a [`resilient::ResilientStore`].
#[async_trait]
impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    async fn count_jobs(&self, cancel: &CancellationToken) -> Result<u64> {
        (**self).count_jobs(cancel).await
    }

    async fn count_incomplete_partitions(
        &self,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        (**self).count_incomplete_partitions(job_id, cancel).await
    }

    async fn insert_job(&self, job: &Job, cancel: &CancellationToken) -> Result<()> {
        (**self).insert_job(job, cancel).await
    }

    async fn retrieve_job(&self, id: &JobId, cancel: &CancellationToken) -> Result<Job> {
        (**self).retrieve_job(id, cancel).await
    }

    async fn mark_job_as_ready(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        (**self).mark_job_as_ready(id, timestamp, cancel).await
    }

    async fn mark_job_as_started(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        (**self).mark_job_as_started(id, timestamp, cancel).await
    }

    async fn mark_job_as_completed(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        (**self).mark_job_as_completed(id, timestamp, cancel).await
    }

    async fn mark_job_as_failed(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        error: &str,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        (**self).mark_job_as_failed(id, timestamp, error, cancel).await
    }

    async fn insert_partition(
        &self,
        partition: &Partition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        (**self).insert_partition(partition, cancel).await
    }

    async fn insert_split_partition(
        &self,
        partition_to_update: &Partition,
        partition_to_insert: &Partition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        (**self).insert_split_partition(partition_to_update, partition_to_insert, cancel).await
    }

    async fn retrieve_partition(
        &self,
        id: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<Partition> {
        (**self).retrieve_partition(id, cancel).await
    }

    async fn try_acquire_partition(
        &self,
        job_id: &JobId,
        requester: &str,
        timestamp: DateTime<Utc>,
        active: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<Partition>> {
        (**self).try_acquire_partition(job_id, requester, timestamp, active, cancel).await
    }

    async fn report_progress(
        &self,
        report: &ProgressReport,
        cancel: &CancellationToken,
    ) -> Result<Partition> {
        (**self).report_progress(report, cancel).await
    }

    async fn try_request_split(
        &self,
        job_id: &JobId,
        requester: &str,
        active: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        (**self).try_request_split(job_id, requester, active, cancel).await
    }

    async fn is_split_request_pending(
        &self,
        job_id: &JobId,
        requester: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        (**self).is_split_request_pending(job_id, requester, cancel).await
    }

    async fn retrieve_job_status_report(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<StatusReport> {
        (**self).retrieve_job_status_report(id, timestamp, cancel).await
    }
}

/// Returns [`Error::Canceled`] if `cancel` has fired.
///
/// Implementations call this at operation boundaries, before any mutation.
///
/// # Errors
///
/// [`Error::Canceled`] when the token is cancelled.
pub fn ensure_not_canceled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Canceled)
    } else {
        Ok(())
    }
}
