//! Caller-supplied key source and processing function.
//!
//! The engine does not know how keys are produced or consumed. A
//! [`DataSource`] enumerates keys of a range in order and estimates range
//! sizes; a [`BatchProcessor`] does the actual work for a batch of keys.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use keyshard_core::{KeyArithmetics, KeySerializer, Range};

use crate::error::Result;

/// Enumerates the keys of a key space.
#[async_trait]
pub trait DataSource<K>: Send + Sync {
    /// Estimates the number of keys in `range`.
    ///
    /// Used to seed `remaining` on new partitions; it need not be exact.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying source cannot be queried.
    async fn estimate_range_size(&self, range: &Range<K>, cancel: &CancellationToken)
    -> Result<u64>;

    /// Returns up to `limit` keys of `range` in ascending order, starting
    /// strictly after `after` (or at `range.first` when `after` is `None`).
    ///
    /// An empty batch means the range is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying source cannot be queried.
    async fn next_batch(
        &self,
        range: &Range<K>,
        after: Option<&K>,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<K>>;
}

/// Processes batches of keys.
#[async_trait]
pub trait BatchProcessor<K>: Send + Sync {
    /// Processes `keys`, which are ascending and belong to one partition.
    ///
    /// A batch may be delivered more than once if a lease is lost after the
    /// batch was processed but before progress was persisted.
    ///
    /// # Errors
    ///
    /// Any error fails the job.
    async fn process(&self, keys: &[K], cancel: &CancellationToken) -> Result<()>;
}

/// Everything the engine needs to know about a key type.
pub struct KeySpace<K> {
    /// Enumerates keys and estimates range sizes.
    pub source: Arc<dyn DataSource<K>>,
    /// Orders keys and chooses split points.
    pub arithmetics: Arc<dyn KeyArithmetics<K>>,
    /// Converts keys to and from their stored form.
    pub serializer: Arc<dyn KeySerializer<K>>,
}

impl<K> KeySpace<K> {
    /// Bundles a data source with its key rules.
    #[must_use]
    pub fn new(
        source: Arc<dyn DataSource<K>>,
        arithmetics: Arc<dyn KeyArithmetics<K>>,
        serializer: Arc<dyn KeySerializer<K>>,
    ) -> Self {
        Self {
            source,
            arithmetics,
            serializer,
        }
    }
}

impl<K> Clone for KeySpace<K> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            arithmetics: Arc::clone(&self.arithmetics),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

impl<K> fmt::Debug for KeySpace<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySpace").finish_non_exhaustive()
    }
}
