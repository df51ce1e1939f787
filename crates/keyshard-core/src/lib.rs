//! # keyshard-core
//!
//! Core abstractions shared by every keyshard component.
//!
//! This crate provides the foundational types used by the coordination engine
//! and by callers that plug their own key spaces into it:
//!
//! - **Identifiers**: Strongly-typed IDs for jobs and partitions
//! - **Key Ranges**: Ordered ranges over opaque keys, with an inclusive flag on the upper bound
//! - **Key Spaces**: Traits for comparing, splitting and serializing keys
//! - **Clock**: A time source that tests can replace
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use keyshard_core::prelude::*;
//!
//! let job = JobId::new("nightly-reindex").unwrap();
//! let partition = PartitionId::generate();
//!
//! let range = Range::new(1_i64, 1_000, true);
//! let split = Int64KeyArithmetics.split(&range, Some(&200)).unwrap();
//! assert_eq!(split.upper.last, 1_000);
//! # let _ = (job, partition);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod error;
pub mod id;
pub mod key;
pub mod observability;
pub mod range;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use keyshard_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::error::{Error, Result};
    pub use crate::id::{JobId, PartitionId};
    pub use crate::key::{
        Int64KeyArithmetics, Int64KeySerializer, KeyArithmetics, KeySerializer,
        StringKeySerializer,
    };
    pub use crate::range::{Range, RangeSplit};
}

// Re-export key types at crate root for ergonomics
pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use id::{JobId, PartitionId};
pub use key::{
    Int64KeyArithmetics, Int64KeySerializer, KeyArithmetics, KeySerializer, StringKeySerializer,
};
pub use observability::{LogFormat, init_logging};
pub use range::{Range, RangeSplit};
