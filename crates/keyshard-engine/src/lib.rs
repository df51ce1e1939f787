//! # keyshard-engine
//!
//! Store-coordinated processing of large ordered key ranges.
//!
//! Many independent workers cooperate on one job without talking to each
//! other. All coordination goes through a shared transactional [`Store`]:
//!
//! - **Partitions**: The job's key range is cut into contiguous, non-overlapping
//!   partitions that together always cover the whole range
//! - **Leases**: A worker owns a partition for as long as its progress reports
//!   keep arriving; stale partitions are reclaimed by the next acquisition
//! - **Dynamic Splits**: Idle workers ask busy ones to split; the owner cuts
//!   off the unprocessed upper half as a new partition
//! - **Job Lifecycle**: `Initializing → Ready → Processing → Completed | Failed`
//! - **Status Reports**: Point-in-time progress aggregated over all partitions
//!
//! ## Guarantees
//!
//! - **Coverage**: No key is lost or covered twice, including during splits
//! - **Exclusive Ownership**: At most one worker holds a partition at a time
//! - **Replay Safety**: Every store write is conditioned on a precise pre-state,
//!   so retried writes never double-apply
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use keyshard_engine::prelude::*;
//! use keyshard_engine::store::memory::InMemoryStore;
//!
//! let store: Arc<dyn Store> = Arc::new(ResilientStore::new(InMemoryStore::new()));
//! let scheduler = Scheduler::new(Arc::clone(&store));
//! let engine = Engine::new(store, EngineConfig::default()).with_worker_id("W1");
//! assert_eq!(engine.worker_id(), "W1");
//! # let _ = scheduler;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod lease;
pub mod metrics;
pub mod partition;
pub mod scheduler;
pub mod source;
pub mod split;
pub mod status;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{EngineConfig, JobSettings, RetryConfig};
    pub use crate::engine::{Engine, RunSummary};
    pub use crate::error::{EntityKind, Error, Result};
    pub use crate::job::{Job, JobState};
    pub use crate::lease::{DefaultLeasePolicy, LeasePolicy, StrictLeasePolicy};
    pub use crate::metrics::EngineMetrics;
    pub use crate::partition::{Partition, ProgressReport};
    pub use crate::scheduler::Scheduler;
    pub use crate::source::{BatchProcessor, DataSource, KeySpace};
    pub use crate::split::{SplitPlan, plan_split};
    pub use crate::status::{PartitionCounts, ProgressTotals, StatusReport};
    pub use crate::store::Store;
    pub use crate::store::resilient::{
        ExponentialBackoff, ResilientStore, RetryStrategy, TransientErrorDetector,
        TransientKindDetector,
    };
}

pub use store::Store;
