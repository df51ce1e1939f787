//! Lease expiry policy.
//!
//! A worker holds a partition for as long as its progress reports keep the
//! partition's `updated` timestamp fresh. There is no background sweeper:
//! staleness is detected lazily, when another worker's acquisition compares
//! `updated` against the *active threshold* computed here. Partitions updated
//! before the threshold are considered abandoned.
//!
//! How clock drift widens or narrows the lease window is deployment policy,
//! so it is injectable rather than hard-coded.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::job::Job;

/// Computes the timestamp before which a lease is considered expired.
pub trait LeasePolicy: Send + Sync {
    /// Returns the active threshold for `job` as of `now`.
    fn active_threshold(&self, now: DateTime<Utc>, job: &Job) -> DateTime<Utc>;
}

/// Expires leases after `timeout + clock_drift` without a heartbeat.
///
/// This is the conservative choice: a worker whose clock lags by up to
/// `clock_drift` never loses a lease it is still renewing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLeasePolicy;

impl LeasePolicy for DefaultLeasePolicy {
    fn active_threshold(&self, now: DateTime<Utc>, job: &Job) -> DateTime<Utc> {
        subtract(now, job.timeout.saturating_add(job.clock_drift))
    }
}

/// Expires leases after `timeout - clock_drift` without a heartbeat.
///
/// Reclaims abandoned work sooner at the cost of occasionally evicting a
/// worker whose clock runs behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictLeasePolicy;

impl LeasePolicy for StrictLeasePolicy {
    fn active_threshold(&self, now: DateTime<Utc>, job: &Job) -> DateTime<Utc> {
        subtract(now, job.timeout.saturating_sub(job.clock_drift))
    }
}

fn subtract(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
