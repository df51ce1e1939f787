//! A dense `i64` key space and a recording batch processor.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use keyshard_core::{Int64KeyArithmetics, Int64KeySerializer, Range};
use keyshard_engine::error::{Error, Result};
use keyshard_engine::source::{BatchProcessor, DataSource, KeySpace};

/// Every integer in a range is a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceDataSource;

impl SequenceDataSource {
    /// Returns a key space over this source with the stock `i64` rules.
    #[must_use]
    pub fn key_space() -> KeySpace<i64> {
        KeySpace::new(
            Arc::new(Self),
            Arc::new(Int64KeyArithmetics),
            Arc::new(Int64KeySerializer),
        )
    }
}

/// Returns the exclusive end of `range` in `i128` so the full `i64` domain fits.
fn end_exclusive(range: &Range<i64>) -> i128 {
    i128::from(range.last) + i128::from(range.inclusive)
}

#[async_trait]
impl DataSource<i64> for SequenceDataSource {
    async fn estimate_range_size(
        &self,
        range: &Range<i64>,
        _cancel: &CancellationToken,
    ) -> Result<u64> {
        let size = end_exclusive(range) - i128::from(range.first);
        Ok(u64::try_from(size.max(0)).unwrap_or(u64::MAX))
    }

    async fn next_batch(
        &self,
        range: &Range<i64>,
        after: Option<&i64>,
        limit: u32,
        _cancel: &CancellationToken,
    ) -> Result<Vec<i64>> {
        let start = after.map_or(i128::from(range.first), |p| {
            (i128::from(*p) + 1).max(i128::from(range.first))
        });
        let end = end_exclusive(range).min(start + i128::from(limit));
        Ok((start..end)
            .map(|key| i64::try_from(key).expect("key within range"))
            .collect())
    }
}

/// Records every key it is asked to process.
#[derive(Debug, Default)]
pub struct RecordingProcessor {
    seen: Mutex<BTreeMap<i64, u32>>,
    delay: Option<Duration>,
    fail_on: Option<i64>,
}

impl RecordingProcessor {
    /// Creates a processor that accepts every batch immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` per batch, giving idle workers time to request splits.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fails any batch containing `key`.
    #[must_use]
    pub fn failing_on(mut self, key: i64) -> Self {
        self.fail_on = Some(key);
        self
    }

    /// Returns each key seen with the number of times it was processed.
    pub fn seen(&self) -> BTreeMap<i64, u32> {
        self.seen.lock().unwrap().clone()
    }

    /// Returns the number of distinct keys processed.
    pub fn distinct(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl BatchProcessor<i64> for RecordingProcessor {
    async fn process(&self, keys: &[i64], cancel: &CancellationToken) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Canceled),
                () = tokio::time::sleep(delay) => {}
            }
        }
        if let Some(bad) = self.fail_on {
            if keys.contains(&bad) {
                return Err(Error::processing(format!("cannot process key {bad}")));
            }
        }
        let mut seen = self.seen.lock().unwrap();
        for key in keys {
            *seen.entry(*key).or_default() += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batches_resume_after_position() {
        let cancel = CancellationToken::new();
        let range = Range::new(1, 10, true);

        let first = SequenceDataSource
            .next_batch(&range, None, 4, &cancel)
            .await
            .unwrap();
        let second = SequenceDataSource
            .next_batch(&range, Some(&4), 4, &cancel)
            .await
            .unwrap();
        let last = SequenceDataSource
            .next_batch(&range, Some(&8), 4, &cancel)
            .await
            .unwrap();

        assert_eq!(first, vec![1, 2, 3, 4]);
        assert_eq!(second, vec![5, 6, 7, 8]);
        assert_eq!(last, vec![9, 10]);
    }

    #[tokio::test]
    async fn exclusive_range_excludes_last() {
        let cancel = CancellationToken::new();
        let range = Range::new(1, 5, false);

        let keys = SequenceDataSource
            .next_batch(&range, None, 10, &cancel)
            .await
            .unwrap();
        assert_eq!(keys, vec![1, 2, 3, 4]);
        assert_eq!(
            SequenceDataSource
                .estimate_range_size(&range, &cancel)
                .await
                .unwrap(),
            4
        );
    }
}
