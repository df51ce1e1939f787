//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], the reference implementation of
//! the [`Store`] trait. All state lives behind one `RwLock`, so every
//! operation is trivially atomic and serializable.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: Workers must share the same `InMemoryStore` instance
//! - **No persistence**: All state is lost when the process exits

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use keyshard_core::{JobId, PartitionId};

use super::{Store, ensure_not_canceled};
use crate::error::{EntityKind, Error, Result};
use crate::job::{Job, JobState};
use crate::lease::{DefaultLeasePolicy, LeasePolicy};
use crate::partition::{Partition, ProgressReport};
use crate::status::StatusReport;

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    partitions: HashMap<PartitionId, Partition>,
}

impl Tables {
    fn job(&self, id: &JobId) -> Result<&Job> {
        self.jobs.get(id).ok_or_else(|| Error::unknown_job(id))
    }

    fn partitions_of<'a>(&'a self, job_id: &'a JobId) -> impl Iterator<Item = &'a Partition> {
        self.partitions.values().filter(move |p| &p.job_id == job_id)
    }

    fn insert_partition(&mut self, partition: &Partition) -> Result<()> {
        if !self.jobs.contains_key(&partition.job_id) {
            return Err(Error::InvalidReference {
                job_id: partition.job_id.clone(),
            });
        }
        if self.partitions.contains_key(&partition.id) {
            return Err(Error::DuplicateIdentifier {
                kind: EntityKind::Partition,
                id: partition.id.to_string(),
            });
        }
        self.partitions.insert(partition.id, partition.clone());
        Ok(())
    }

    /// Looks up a partition for a conditional update by `owner`.
    fn owned_partition_mut(&mut self, id: PartitionId, owner: &str) -> Result<&mut Partition> {
        let partition = self
            .partitions
            .get_mut(&id)
            .ok_or_else(|| Error::unknown_partition(id))?;
        if !partition.is_owned_by(owner) {
            return Err(Error::LockConflict {
                partition_id: id,
                owner: owner.to_string(),
            });
        }
        Ok(partition)
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// Acquisition preference: most remaining work first, then the longest idle,
/// then by id so the choice is deterministic.
fn acquisition_order(a: &Partition, b: &Partition) -> Ordering {
    b.remaining
        .cmp(&a.remaining)
        .then_with(|| a.updated.cmp(&b.updated))
        .then_with(|| a.id.cmp(&b.id))
}

fn split_order(a: &Partition, b: &Partition) -> Ordering {
    b.remaining.cmp(&a.remaining).then_with(|| a.id.cmp(&b.id))
}

/// In-memory store for testing.
///
/// ## Example
///
/// ```rust
/// use keyshard_engine::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// // Share with workers via Arc...
/// # let _ = store;
/// ```
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    lease_policy: Arc<dyn LeasePolicy>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store using [`DefaultLeasePolicy`] for status reports.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lease_policy(Arc::new(DefaultLeasePolicy))
    }

    /// Creates an empty store with a custom lease policy.
    ///
    /// The policy only affects [`Store::retrieve_job_status_report`]; every
    /// other operation receives its threshold from the caller.
    #[must_use]
    pub fn with_lease_policy(lease_policy: Arc<dyn LeasePolicy>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            lease_policy,
        }
    }

    /// Returns a snapshot of every partition of `job_id`, ordered by first key.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn partitions(&self, job_id: &JobId) -> Result<Vec<Partition>> {
        let mut partitions: Vec<Partition> = {
            let tables = self.tables.read().map_err(poison_err)?;
            tables.partitions_of(job_id).cloned().collect()
        };
        partitions.sort_by(|a, b| a.first.cmp(&b.first).then_with(|| a.id.cmp(&b.id)));
        Ok(partitions)
    }

    fn transition(
        &self,
        id: &JobId,
        target: JobState,
        timestamp: DateTime<Utc>,
        error: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        ensure_not_canceled(cancel)?;
        let mut tables = self.tables.write().map_err(poison_err)?;
        let job = tables
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::unknown_job(id))?;
        job.transition_to(target, timestamp, error.map(str::to_string))?;
        let job = job.clone();
        drop(tables);
        Ok(job)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn count_jobs(&self, cancel: &CancellationToken) -> Result<u64> {
        ensure_not_canceled(cancel)?;
        let count = {
            let tables = self.tables.read().map_err(poison_err)?;
            tables.jobs.len()
        };
        Ok(count as u64)
    }

    async fn count_incomplete_partitions(
        &self,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        ensure_not_canceled(cancel)?;
        let tables = self.tables.read().map_err(poison_err)?;
        tables.job(job_id)?;
        let count = tables.partitions_of(job_id).filter(|p| !p.is_completed).count();
        drop(tables);
        Ok(count as u64)
    }

    async fn insert_job(&self, job: &Job, cancel: &CancellationToken) -> Result<()> {
        ensure_not_canceled(cancel)?;
        let mut tables = self.tables.write().map_err(poison_err)?;
        if tables.jobs.contains_key(&job.id) {
            drop(tables);
            return Err(Error::DuplicateIdentifier {
                kind: EntityKind::Job,
                id: job.id.to_string(),
            });
        }
        tables.jobs.insert(job.id.clone(), job.clone());
        drop(tables);
        Ok(())
    }

    async fn retrieve_job(&self, id: &JobId, cancel: &CancellationToken) -> Result<Job> {
        ensure_not_canceled(cancel)?;
        let tables = self.tables.read().map_err(poison_err)?;
        let job = tables.job(id)?.clone();
        drop(tables);
        Ok(job)
    }

    async fn mark_job_as_ready(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        self.transition(id, JobState::Ready, timestamp, None, cancel)
    }

    async fn mark_job_as_started(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        self.transition(id, JobState::Processing, timestamp, None, cancel)
    }

    async fn mark_job_as_completed(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        self.transition(id, JobState::Completed, timestamp, None, cancel)
    }

    async fn mark_job_as_failed(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        error: &str,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        self.transition(id, JobState::Failed, timestamp, Some(error), cancel)
    }

    async fn insert_partition(
        &self,
        partition: &Partition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_not_canceled(cancel)?;
        let mut tables = self.tables.write().map_err(poison_err)?;
        let result = tables.insert_partition(partition);
        drop(tables);
        result
    }

    async fn insert_split_partition(
        &self,
        partition_to_update: &Partition,
        partition_to_insert: &Partition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_not_canceled(cancel)?;
        let owner = partition_to_update.owner.as_deref().unwrap_or_default();

        let mut tables = self.tables.write().map_err(poison_err)?;

        // Validate everything before touching state so a failure leaves no trace.
        let stored = tables.owned_partition_mut(partition_to_update.id, owner)?;
        let already_shrunk = stored.last == partition_to_update.last
            && stored.is_inclusive == partition_to_update.is_inclusive;
        if !tables.jobs.contains_key(&partition_to_insert.job_id) {
            return Err(Error::InvalidReference {
                job_id: partition_to_insert.job_id.clone(),
            });
        }
        if tables.partitions.contains_key(&partition_to_insert.id) {
            if already_shrunk {
                // Replay of a split that already committed.
                return Ok(());
            }
            return Err(Error::DuplicateIdentifier {
                kind: EntityKind::Partition,
                id: partition_to_insert.id.to_string(),
            });
        }

        let stored = tables.owned_partition_mut(partition_to_update.id, owner)?;
        stored.updated = partition_to_update.updated;
        stored.last.clone_from(&partition_to_update.last);
        stored.is_inclusive = partition_to_update.is_inclusive;
        stored.position.clone_from(&partition_to_update.position);
        stored.processed = partition_to_update.processed;
        stored.remaining = partition_to_update.remaining;
        stored.throughput = partition_to_update.throughput;
        stored.split_requester = None;

        tables
            .partitions
            .insert(partition_to_insert.id, partition_to_insert.clone());
        drop(tables);
        Ok(())
    }

    async fn retrieve_partition(
        &self,
        id: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<Partition> {
        ensure_not_canceled(cancel)?;
        let partition = {
            let tables = self.tables.read().map_err(poison_err)?;
            tables.partitions.get(&id).cloned()
        };
        partition.ok_or_else(|| Error::unknown_partition(id))
    }

    async fn try_acquire_partition(
        &self,
        job_id: &JobId,
        requester: &str,
        timestamp: DateTime<Utc>,
        active: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<Partition>> {
        ensure_not_canceled(cancel)?;
        let mut tables = self.tables.write().map_err(poison_err)?;
        tables.job(job_id)?;

        // A partition the requester already holds comes back first, so a
        // replayed acquisition does not strand it until the lease expires.
        let candidate = tables
            .partitions_of(job_id)
            .filter(|p| !p.is_completed && p.is_owned_by(requester))
            .min_by(|a, b| acquisition_order(a, b))
            .or_else(|| {
                tables
                    .partitions_of(job_id)
                    .filter(|p| p.is_acquirable(active))
                    .min_by(|a, b| acquisition_order(a, b))
            })
            .map(|p| p.id);

        let acquired = candidate.and_then(|id| tables.partitions.get_mut(&id)).map(|p| {
            p.owner = Some(requester.to_string());
            p.updated = timestamp;
            p.clone()
        });
        drop(tables);
        Ok(acquired)
    }

    async fn report_progress(
        &self,
        report: &ProgressReport,
        cancel: &CancellationToken,
    ) -> Result<Partition> {
        ensure_not_canceled(cancel)?;
        let mut tables = self.tables.write().map_err(poison_err)?;
        let partition = tables.owned_partition_mut(report.id, &report.owner)?;
        report.apply(partition);
        let partition = partition.clone();
        drop(tables);
        Ok(partition)
    }

    async fn try_request_split(
        &self,
        job_id: &JobId,
        requester: &str,
        active: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        ensure_not_canceled(cancel)?;
        let mut tables = self.tables.write().map_err(poison_err)?;
        tables.job(job_id)?;

        let candidate = tables
            .partitions_of(job_id)
            .filter(|p| p.accepts_split_request(active))
            .min_by(|a, b| split_order(a, b))
            .map(|p| p.id);

        let requested = match candidate.and_then(|id| tables.partitions.get_mut(&id)) {
            Some(partition) => {
                partition.split_requester = Some(requester.to_string());
                true
            }
            None => false,
        };
        drop(tables);
        Ok(requested)
    }

    async fn is_split_request_pending(
        &self,
        job_id: &JobId,
        requester: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        ensure_not_canceled(cancel)?;
        let tables = self.tables.read().map_err(poison_err)?;
        tables.job(job_id)?;
        let pending = tables
            .partitions_of(job_id)
            .any(|p| p.split_requester.as_deref() == Some(requester));
        drop(tables);
        Ok(pending)
    }

    async fn retrieve_job_status_report(
        &self,
        id: &JobId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<StatusReport> {
        ensure_not_canceled(cancel)?;
        let tables = self.tables.read().map_err(poison_err)?;
        let job = tables.job(id)?;
        let active = self.lease_policy.active_threshold(timestamp, job);
        let report = StatusReport::aggregate(job, tables.partitions_of(id), timestamp, active);
        drop(tables);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobSettings;
    use chrono::Duration;
    use keyshard_core::Range;

    fn job_id() -> JobId {
        JobId::new("J1").unwrap()
    }

    async fn store_with_job() -> (InMemoryStore, CancellationToken, DateTime<Utc>) {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        let now = Utc::now();
        let job = Job::new(job_id(), &JobSettings::default(), now);
        store.insert_job(&job, &cancel).await.unwrap();
        (store, cancel, now)
    }

    fn partition(first: &str, last: &str, remaining: u64, now: DateTime<Utc>) -> Partition {
        Partition::new(
            job_id(),
            Range::new(first.to_string(), last.to_string(), true),
            remaining,
            now,
        )
    }

    #[tokio::test]
    async fn insert_job_rejects_duplicates() {
        let (store, cancel, now) = store_with_job().await;
        let job = Job::new(job_id(), &JobSettings::default(), now);

        let err = store.insert_job(&job, &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateIdentifier {
                kind: EntityKind::Job,
                ..
            }
        ));
        assert_eq!(store.count_jobs(&cancel).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_partition_requires_existing_job() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        let orphan = partition("a", "z", 26, Utc::now());

        let err = store.insert_partition(&orphan, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InvalidReference { .. }));
    }

    #[tokio::test]
    async fn acquire_prefers_most_remaining() {
        let (store, cancel, now) = store_with_job().await;
        let small = partition("a", "f", 6, now);
        let large = partition("g", "z", 20, now);
        store.insert_partition(&small, &cancel).await.unwrap();
        store.insert_partition(&large, &cancel).await.unwrap();

        let acquired = store
            .try_acquire_partition(&job_id(), "W1", now, now, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acquired.id, large.id);
        assert_eq!(acquired.owner.as_deref(), Some("W1"));
    }

    #[tokio::test]
    async fn acquire_skips_active_leases() {
        let (store, cancel, now) = store_with_job().await;
        store
            .insert_partition(&partition("a", "z", 26, now), &cancel)
            .await
            .unwrap();
        let active = now - Duration::seconds(60);

        let first = store
            .try_acquire_partition(&job_id(), "W1", now, active, &cancel)
            .await
            .unwrap();
        let second = store
            .try_acquire_partition(&job_id(), "W2", now, active, &cancel)
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn acquire_unknown_job_fails() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        let now = Utc::now();

        let err = store
            .try_acquire_partition(&job_id(), "W1", now, now, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_unknown_identifier());
    }

    #[tokio::test]
    async fn report_progress_distinguishes_missing_from_stolen() {
        let (store, cancel, now) = store_with_job().await;
        let p = partition("a", "z", 26, now);
        store.insert_partition(&p, &cancel).await.unwrap();
        store
            .try_acquire_partition(&job_id(), "W1", now, now, &cancel)
            .await
            .unwrap();

        let mut report = ProgressReport {
            id: p.id,
            owner: "W2".into(),
            timestamp: now,
            position: "c".into(),
            processed: 3,
            remaining: 23,
            completed: false,
            throughput: 1.0,
            release_split_request: false,
        };
        let err = store.report_progress(&report, &cancel).await.unwrap_err();
        assert!(err.is_lock_conflict());

        report.id = PartitionId::generate();
        let err = store.report_progress(&report, &cancel).await.unwrap_err();
        assert!(err.is_unknown_identifier());
    }

    #[tokio::test]
    async fn split_update_conflict_leaves_no_insert() {
        let (store, cancel, now) = store_with_job().await;
        let p = partition("a", "z", 26, now);
        store.insert_partition(&p, &cancel).await.unwrap();
        store
            .try_acquire_partition(&job_id(), "W1", now, now, &cancel)
            .await
            .unwrap();

        let mut update = store.retrieve_partition(p.id, &cancel).await.unwrap();
        update.owner = Some("W2".into());
        update.last = "m".into();
        let insert = partition("n", "z", 13, now);

        let err = store
            .insert_split_partition(&update, &insert, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_lock_conflict());
        assert_eq!(store.partitions(&job_id()).unwrap().len(), 1);
        assert_eq!(store.retrieve_partition(p.id, &cancel).await.unwrap().last, "z");
    }

    #[tokio::test]
    async fn replayed_split_is_noop() {
        let (store, cancel, now) = store_with_job().await;
        let p = partition("a", "z", 26, now);
        store.insert_partition(&p, &cancel).await.unwrap();
        store
            .try_acquire_partition(&job_id(), "W1", now, now, &cancel)
            .await
            .unwrap();

        let mut update = store.retrieve_partition(p.id, &cancel).await.unwrap();
        update.last = "m".into();
        let insert = partition("n", "z", 13, now);

        store
            .insert_split_partition(&update, &insert, &cancel)
            .await
            .unwrap();
        store
            .insert_split_partition(&update, &insert, &cancel)
            .await
            .unwrap();
        assert_eq!(store.partitions(&job_id()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn acquire_returns_partition_already_held() {
        let (store, cancel, now) = store_with_job().await;
        store
            .insert_partition(&partition("a", "m", 13, now), &cancel)
            .await
            .unwrap();
        store
            .insert_partition(&partition("n", "z", 13, now), &cancel)
            .await
            .unwrap();
        let active = now - Duration::seconds(60);

        let first = store
            .try_acquire_partition(&job_id(), "W1", now, active, &cancel)
            .await
            .unwrap()
            .unwrap();
        let again = store
            .try_acquire_partition(&job_id(), "W1", now, active, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, again.id);
    }

    #[tokio::test]
    async fn split_request_targets_active_partitions_once() {
        let (store, cancel, now) = store_with_job().await;
        store
            .insert_partition(&partition("a", "z", 26, now), &cancel)
            .await
            .unwrap();
        let active = now - Duration::seconds(60);

        // Unowned partitions are acquired, not split.
        assert!(!store.try_request_split(&job_id(), "W2", active, &cancel).await.unwrap());

        store
            .try_acquire_partition(&job_id(), "W1", now, active, &cancel)
            .await
            .unwrap();
        assert!(store.try_request_split(&job_id(), "W2", active, &cancel).await.unwrap());
        assert!(store.is_split_request_pending(&job_id(), "W2", &cancel).await.unwrap());
        assert!(!store.try_request_split(&job_id(), "W3", active, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn canceled_token_short_circuits() {
        let (store, cancel, now) = store_with_job().await;
        cancel.cancel();

        let err = store
            .mark_job_as_ready(&job_id(), now, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Canceled));

        let fresh = CancellationToken::new();
        let job = store.retrieve_job(&job_id(), &fresh).await.unwrap();
        assert_eq!(job.state, JobState::Initializing);
    }

    #[tokio::test]
    async fn status_report_uses_lease_policy() {
        let (store, cancel, now) = store_with_job().await;
        store
            .insert_partition(&partition("a", "z", 26, now), &cancel)
            .await
            .unwrap();
        let stale = now - Duration::hours(1);
        store
            .try_acquire_partition(&job_id(), "W1", stale, stale, &cancel)
            .await
            .unwrap();

        let report = store
            .retrieve_job_status_report(&job_id(), now, &cancel)
            .await
            .unwrap();
        assert_eq!(report.partitions.abandoned, 1);
        assert_eq!(report.partitions.in_progress, 0);
    }
}
