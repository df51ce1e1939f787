//! Error types for the coordination engine.
//!
//! The variants mirror the outcomes a store operation can signal. Callers are
//! expected to branch on [`Error::LockConflict`] ("stop processing, the lease
//! was reassigned") and [`Error::UnknownIdentifier`] ("this work no longer
//! exists"); those are control flow, not incidental failures.

use std::fmt;

use keyshard_core::{JobId, PartitionId};

use crate::job::JobState;

/// The result type used throughout keyshard-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of entity an identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A job.
    Job,
    /// A partition.
    Partition,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Job => write!(f, "job"),
            Self::Partition => write!(f, "partition"),
        }
    }
}

/// Errors that can occur in engine and store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation addressed a job or partition that does not exist.
    #[error("unknown {kind} identifier: {id}")]
    UnknownIdentifier {
        /// The kind of entity addressed.
        kind: EntityKind,
        /// The identifier that was looked up.
        id: String,
    },

    /// An insert collided with an existing identifier.
    #[error("duplicate {kind} identifier: {id}")]
    DuplicateIdentifier {
        /// The kind of entity inserted.
        kind: EntityKind,
        /// The identifier that already exists.
        id: String,
    },

    /// A partition insert referenced a job that does not exist.
    #[error("partition references unknown job: {job_id}")]
    InvalidReference {
        /// The job the partition pointed at.
        job_id: JobId,
    },

    /// The owner precondition of a conditional update failed while the target
    /// partition still exists: the lease was reassigned.
    #[error("lock on partition {partition_id} is no longer held by {owner}")]
    LockConflict {
        /// The partition whose update was rejected.
        partition_id: PartitionId,
        /// The owner the caller claimed to be.
        owner: String,
    },

    /// A connectivity or contention failure that is expected to succeed if retried.
    #[error("transient failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The operation observed a cancellation signal before completing.
    #[error("operation canceled")]
    Canceled,

    /// A job state transition was attempted from a state that does not allow it.
    #[error("invalid job state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// The current state.
        from: JobState,
        /// The attempted target state.
        to: JobState,
    },

    /// The caller-supplied batch processor or data source failed.
    #[error("processing failed: {message}")]
    Processing {
        /// Description of the failure.
        message: String,
    },

    /// A non-transient storage failure.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An error from keyshard-core.
    #[error("core error: {0}")]
    Core(#[from] keyshard_core::Error),
}

impl Error {
    /// Creates an unknown-job error.
    #[must_use]
    pub fn unknown_job(id: &JobId) -> Self {
        Self::UnknownIdentifier {
            kind: EntityKind::Job,
            id: id.to_string(),
        }
    }

    /// Creates an unknown-partition error.
    #[must_use]
    pub fn unknown_partition(id: PartitionId) -> Self {
        Self::UnknownIdentifier {
            kind: EntityKind::Partition,
            id: id.to_string(),
        }
    }

    /// Creates a new transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new transient error with a source.
    #[must_use]
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new processing error.
    #[must_use]
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
        }
    }

    /// Returns true for failures the resilience decorator may retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if the caller lost its lease on a partition.
    #[must_use]
    pub const fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockConflict { .. })
    }

    /// Returns true if the addressed job or partition does not exist.
    #[must_use]
    pub const fn is_unknown_identifier(&self) -> bool {
        matches!(self, Self::UnknownIdentifier { .. })
    }
}
