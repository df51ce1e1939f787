//! Strongly-typed identifiers for keyshard entities.
//!
//! - **Job IDs** are chosen by the caller that schedules the job, so they are
//!   validated strings rather than generated tokens.
//! - **Partition IDs** are minted by the engine whenever a partition is created
//!   (initial insert or split). They are ULIDs: 128-bit, globally unique without
//!   coordination, and lexicographically sortable by creation time.
//!
//! # Example
//!
//! ```rust
//! use keyshard_core::id::{JobId, PartitionId};
//!
//! let job: JobId = "orders-backfill".parse().unwrap();
//! let partition = PartitionId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: JobId = partition;
//! # let _ = (job, partition);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Maximum length of a job identifier, in characters.
pub const MAX_JOB_ID_LEN: usize = 256;

/// A caller-chosen identifier for a distributed processing job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Creates a job ID after validating it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the value is empty, only whitespace, or
    /// longer than [`MAX_JOB_ID_LEN`] characters.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(Error::InvalidId {
                message: "job ID must not be empty".to_string(),
            });
        }
        let len = value.chars().count();
        if len > MAX_JOB_ID_LEN {
            return Err(Error::InvalidId {
                message: format!("job ID is {len} characters long, limit is {MAX_JOB_ID_LEN}"),
            });
        }
        Ok(Self(value))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A unique identifier for a partition of a job's key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(Ulid);

impl PartitionId {
    /// Generates a new unique partition ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a partition ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PartitionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid partition ID '{s}': {e}"),
            })
    }
}
