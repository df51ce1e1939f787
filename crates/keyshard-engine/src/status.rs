//! Point-in-time progress reports.
//!
//! A [`StatusReport`] is derived, never persisted: it is recomputed on demand
//! from the job and its partitions as of a caller-supplied timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::partition::Partition;

/// Partition counts by processing state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionCounts {
    /// Never claimed and nothing processed.
    pub untouched: u64,
    /// Owned, incomplete, and heartbeating.
    pub in_progress: u64,
    /// Owned and incomplete, but the lease has expired.
    pub abandoned: u64,
    /// Finished.
    pub completed: u64,
}

/// Key totals across all partitions.
///
/// Both are `None` when they cannot be computed, which is different from zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressTotals {
    /// Estimated keys left.
    pub remaining: Option<u64>,
    /// Keys processed.
    pub completed: Option<u64>,
}

/// A snapshot of a job's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// The instant the report describes.
    pub timestamp: DateTime<Utc>,
    /// The job as stored.
    pub job: Job,
    /// Latest partition modification, if the job has partitions.
    pub last_activity: Option<DateTime<Utc>>,
    /// Partitions that have been owned at least once.
    pub ownership_changes: u64,
    /// Partitions with a split request waiting to be fulfilled.
    pub pending_split_requests: u64,
    /// Sum of the latest throughput of in-progress partitions, in keys per second.
    pub current_throughput: f64,
    /// Partition counts by state.
    pub partitions: PartitionCounts,
    /// Key totals.
    pub progress: ProgressTotals,
}

impl StatusReport {
    /// Aggregates a report over `partitions` of `job`.
    ///
    /// `active` is the lease threshold as of `timestamp`: owned partitions
    /// updated before it count as abandoned rather than in progress.
    ///
    /// Full ownership history is not retained, so `ownership_changes` counts
    /// partitions that have ever been owned: currently owned, with processed
    /// keys, or completed.
    #[must_use]
    pub fn aggregate<'a, I>(
        job: &Job,
        partitions: I,
        timestamp: DateTime<Utc>,
        active: DateTime<Utc>,
    ) -> Self
    where
        I: IntoIterator<Item = &'a Partition>,
    {
        let mut counts = PartitionCounts::default();
        let mut ownership_changes = 0;
        let mut pending_split_requests = 0;
        let mut current_throughput = 0.0;
        let mut last_activity: Option<DateTime<Utc>> = None;
        let mut seen = false;
        // None once either sum overflows.
        let mut totals: Option<(u64, u64)> = Some((0, 0));

        for partition in partitions {
            if partition.is_completed {
                counts.completed += 1;
            } else if partition.owner.is_none() {
                if partition.processed == 0 {
                    counts.untouched += 1;
                }
            } else if partition.updated >= active {
                counts.in_progress += 1;
                current_throughput += partition.throughput;
            } else {
                counts.abandoned += 1;
            }

            if partition.owner.is_some() || partition.processed > 0 || partition.is_completed {
                ownership_changes += 1;
            }
            if partition.split_requester.is_some() {
                pending_split_requests += 1;
            }

            last_activity =
                Some(last_activity.map_or(partition.updated, |t| t.max(partition.updated)));

            seen = true;
            totals = totals.and_then(|(remaining, completed)| {
                Some((
                    remaining.checked_add(partition.remaining)?,
                    completed.checked_add(partition.processed)?,
                ))
            });
        }

        let progress = match totals {
            Some((remaining, completed)) if seen => ProgressTotals {
                remaining: Some(remaining),
                completed: Some(completed),
            },
            _ => ProgressTotals::default(),
        };

        Self {
            timestamp,
            job: job.clone(),
            last_activity,
            ownership_changes,
            pending_split_requests,
            current_throughput,
            partitions: counts,
            progress,
        }
    }

    /// Returns the total number of partitions counted.
    #[must_use]
    pub fn partition_total(&self) -> u64 {
        let c = &self.partitions;
        c.untouched + c.in_progress + c.abandoned + c.completed
    }
}
