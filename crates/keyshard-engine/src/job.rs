//! Job lifecycle state machine.
//!
//! ```text
//! Initializing ──► Ready ──► Processing ──► Completed
//!      │             │           │
//!      └─────────────┴───────────┴────────► Failed
//! ```
//!
//! The coordinator creates a job in `Initializing`, populates its initial
//! partition and marks it `Ready`. The first worker to acquire a partition
//! moves it to `Processing`. A job is `Completed` once it has no incomplete
//! partitions left, and `Failed` when the driving process gives up with an
//! error message. There is no transition out of a terminal state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keyshard_core::JobId;

use crate::config::JobSettings;
use crate::error::{Error, Result};

/// Job state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created; partitions are being populated.
    Initializing,
    /// Partitions are in place and may be acquired.
    Ready,
    /// At least one partition has been acquired.
    Processing,
    /// Every partition has been completed.
    Completed,
    /// Processing was abandoned with an error.
    Failed,
}

impl JobState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if workers may acquire partitions in this state.
    #[must_use]
    pub const fn accepts_workers(&self) -> bool {
        matches!(self, Self::Ready | Self::Processing)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Initializing => matches!(target, Self::Ready | Self::Failed),
            Self::Ready => matches!(target, Self::Processing | Self::Failed),
            Self::Processing => matches!(target, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::Initializing
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Ready => write!(f, "READY"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A distributed processing task over one key range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Caller-chosen identifier.
    pub id: JobId,
    /// When the job was created.
    pub created: DateTime<Utc>,
    /// When the job was last modified.
    pub updated: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: JobState,
    /// Maximum number of keys a worker pulls per unit of work.
    pub batch_size: u32,
    /// Time without a progress report after which a partition lease expires.
    #[serde(with = "crate::config::duration_ms")]
    pub timeout: Duration,
    /// Tolerance for clock differences between machines.
    #[serde(with = "crate::config::duration_ms")]
    pub clock_drift: Duration,
    /// When the first partition was acquired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    /// Failure description; present only in the `Failed` state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Creates a job in the `Initializing` state.
    #[must_use]
    pub fn new(id: JobId, settings: &JobSettings, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            created: timestamp,
            updated: timestamp,
            state: JobState::Initializing,
            batch_size: settings.batch_size,
            timeout: settings.timeout,
            clock_drift: settings.clock_drift,
            started: None,
            completed: None,
            error: None,
        }
    }

    /// Applies a lifecycle transition.
    ///
    /// Sets `started` when entering `Processing`, `completed` when entering a
    /// terminal state, and `error` only when entering `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the state machine does not
    /// allow moving from the current state to `target`. The job is left
    /// unchanged in that case.
    pub fn transition_to(
        &mut self,
        target: JobState,
        timestamp: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state,
                to: target,
            });
        }

        self.state = target;
        self.updated = timestamp;

        match target {
            JobState::Processing => self.started = Some(timestamp),
            JobState::Completed => self.completed = Some(timestamp),
            JobState::Failed => {
                self.completed = Some(timestamp);
                self.error = Some(error.unwrap_or_default());
            }
            JobState::Initializing | JobState::Ready => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            JobId::new("J1").unwrap(),
            &JobSettings::default(),
            Utc::now(),
        )
    }

    #[test]
    fn new_job_is_initializing() {
        let job = job();
        assert_eq!(job.state, JobState::Initializing);
        assert!(job.started.is_none());
        assert!(job.completed.is_none());
        assert!(job.error.is_none());
    }

    #[test]
    fn happy_path_sets_timestamps() {
        let mut job = job();
        let t1 = job.created + chrono::Duration::seconds(1);
        let t2 = job.created + chrono::Duration::seconds(2);
        let t3 = job.created + chrono::Duration::seconds(3);

        job.transition_to(JobState::Ready, t1, None).unwrap();
        assert_eq!(job.updated, t1);
        assert!(job.started.is_none());

        job.transition_to(JobState::Processing, t2, None).unwrap();
        assert_eq!(job.started, Some(t2));

        job.transition_to(JobState::Completed, t3, None).unwrap();
        assert_eq!(job.completed, Some(t3));
        assert!(job.error.is_none());
    }

    #[test]
    fn failure_records_error() {
        let mut job = job();
        let now = Utc::now();
        job.transition_to(JobState::Ready, now, None).unwrap();
        job.transition_to(JobState::Failed, now, Some("disk full".into()))
            .unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("disk full"));
        assert_eq!(job.completed, Some(now));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [JobState::Completed, JobState::Failed] {
            for target in [
                JobState::Initializing,
                JobState::Ready,
                JobState::Processing,
                JobState::Completed,
                JobState::Failed,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut job = job();
        let err = job
            .transition_to(JobState::Processing, Utc::now(), None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition {
                from: JobState::Initializing,
                to: JobState::Processing,
            }
        ));
        assert_eq!(job.state, JobState::Initializing);
    }

    #[test]
    fn state_serializes_screaming_snake() {
        let json = serde_json::to_string(&JobState::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
    }
}
