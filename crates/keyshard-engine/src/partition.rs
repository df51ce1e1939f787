//! Partitions: contiguous, non-overlapping slices of a job's key range.
//!
//! Keys are stored in their serialized form; the engine converts them with
//! the caller's [`KeySerializer`](keyshard_core::KeySerializer) when it needs
//! to compare or split them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keyshard_core::{JobId, PartitionId, Range};

/// A slice of a job's key range, independently ownable and processable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    /// Unique identifier minted when the partition was created.
    pub id: PartitionId,
    /// The job this partition belongs to.
    pub job_id: JobId,
    /// When the partition was created.
    pub created: DateTime<Utc>,
    /// Last modification; doubles as the lease heartbeat.
    pub updated: DateTime<Utc>,
    /// Worker currently holding the lease, if any.
    pub owner: Option<String>,
    /// First key of the range (inclusive).
    pub first: String,
    /// Last key of the range.
    pub last: String,
    /// Whether `last` belongs to the range.
    pub is_inclusive: bool,
    /// Last key actually processed.
    pub position: Option<String>,
    /// Number of keys processed so far.
    pub processed: u64,
    /// Estimated number of keys left.
    pub remaining: u64,
    /// Most recent throughput measurement, in keys per second.
    pub throughput: f64,
    /// Whether every key of the range has been processed.
    pub is_completed: bool,
    /// Worker that asked for this partition to be split, if a request is pending.
    pub split_requester: Option<String>,
}

impl Partition {
    /// Creates an unowned, untouched partition covering `range`.
    #[must_use]
    pub fn new(
        job_id: JobId,
        range: Range<String>,
        remaining: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PartitionId::generate(),
            job_id,
            created: timestamp,
            updated: timestamp,
            owner: None,
            first: range.first,
            last: range.last,
            is_inclusive: range.inclusive,
            position: None,
            processed: 0,
            remaining,
            throughput: 0.0,
            is_completed: false,
            split_requester: None,
        }
    }

    /// Returns the serialized key range.
    #[must_use]
    pub fn range(&self) -> Range<String> {
        Range::new(self.first.clone(), self.last.clone(), self.is_inclusive)
    }

    /// Returns true if `worker` holds the lease.
    #[must_use]
    pub fn is_owned_by(&self, worker: &str) -> bool {
        self.owner.as_deref() == Some(worker)
    }

    /// Returns true if a worker heartbeat arrived at or after `active`.
    #[must_use]
    pub fn is_active(&self, active: DateTime<Utc>) -> bool {
        self.owner.is_some() && self.updated >= active
    }

    /// Returns true if the partition may be handed to a new worker: it is
    /// incomplete and either unowned or its lease expired before `active`.
    #[must_use]
    pub fn is_acquirable(&self, active: DateTime<Utc>) -> bool {
        !self.is_completed && (self.owner.is_none() || self.updated < active)
    }

    /// Returns true if an idle worker may ask for this partition to be split.
    #[must_use]
    pub fn accepts_split_request(&self, active: DateTime<Utc>) -> bool {
        !self.is_completed && self.is_active(active) && self.split_requester.is_none()
    }

    /// Returns true if no worker has ever made progress on or held this partition.
    #[must_use]
    pub fn is_untouched(&self) -> bool {
        !self.is_completed && self.owner.is_none() && self.processed == 0
    }
}

/// Arguments of a progress report from the partition owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    /// The partition being reported on.
    pub id: PartitionId,
    /// The worker claiming to hold the lease.
    pub owner: String,
    /// When the report was produced; becomes the new heartbeat.
    pub timestamp: DateTime<Utc>,
    /// Last key processed.
    pub position: String,
    /// Total keys processed so far (absolute, not a delta).
    pub processed: u64,
    /// Estimated keys left.
    pub remaining: u64,
    /// Whether the partition is finished.
    pub completed: bool,
    /// Throughput of the most recent batch, in keys per second.
    pub throughput: f64,
    /// Drops a pending split request the owner cannot fulfil.
    #[serde(default)]
    pub release_split_request: bool,
}

impl ProgressReport {
    /// Applies this report to `partition`.
    ///
    /// `remaining` is forced to zero on completion and to at least one while
    /// the partition is still open. The caller is responsible for having
    /// checked ownership.
    pub fn apply(&self, partition: &mut Partition) {
        partition.updated = self.timestamp;
        partition.position = Some(self.position.clone());
        partition.processed = self.processed;
        partition.remaining = if self.completed {
            0
        } else {
            self.remaining.max(1)
        };
        partition.throughput = self.throughput;
        partition.is_completed = self.completed;
        if self.completed || self.release_split_request {
            partition.split_requester = None;
        }
    }
}
