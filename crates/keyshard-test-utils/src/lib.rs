//! Shared test utilities for keyshard integration tests.
//!
//! This crate provides:
//! - [`TestContext`]: An in-memory store, simulated clock and scheduled job
//! - [`FaultInjectingStore`]: A store decorator that injects transient failures
//! - [`SequenceDataSource`] / [`RecordingProcessor`]: A dense `i64` key space
//!   and a processor that remembers what it saw
//! - Custom assertion helpers for the coverage and ownership guarantees
//!
//! # Example
//!
//! ```rust,ignore
//! use keyshard_test_utils::{TestContext, assert_exact_cover};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::new("J1");
//!     let range = ctx.schedule(1, 1_000).await;
//!     assert_exact_cover(&ctx.partitions(), &range);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod simulation;
pub mod sources;

pub use assertions::*;
pub use fixtures::*;
pub use simulation::*;
pub use sources::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("keyshard=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
