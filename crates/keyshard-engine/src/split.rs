//! Split fulfilment.
//!
//! An idle worker only *requests* a split; the owner of the partition carries
//! it out, because only the owner knows how far processing has got. The owner
//! cuts the unprocessed part of its range in two, keeps the lower half, and
//! hands the upper half to the store as a new unowned partition. The store
//! applies both halves in one atomic [`insert_split_partition`] call.
//!
//! [`insert_split_partition`]: crate::store::Store::insert_split_partition

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use keyshard_core::{KeyArithmetics, KeySerializer, Range};

use crate::error::Result;
use crate::partition::Partition;
use crate::source::DataSource;

/// The two halves of a planned split.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPlan {
    /// The existing partition, shrunk to the lower half. Keeps owner,
    /// position and processed count; its split request is cleared.
    pub update: Partition,
    /// A new unowned partition covering the upper half.
    pub insert: Partition,
}

/// Plans a split of `partition` after its current position.
///
/// Returns `Ok(None)` if fewer than two unprocessed keys remain.
///
/// # Errors
///
/// Returns an error if a stored key cannot be deserialized, a split key cannot
/// be serialized, or the data source fails to estimate a half.
pub async fn plan_split<K>(
    partition: &Partition,
    arithmetics: &dyn KeyArithmetics<K>,
    serializer: &dyn KeySerializer<K>,
    source: &dyn DataSource<K>,
    timestamp: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<Option<SplitPlan>>
where
    K: Send + Sync,
{
    let range = partition
        .range()
        .try_map(|key| serializer.deserialize(key))?;
    let position = partition
        .position
        .as_deref()
        .map(|key| serializer.deserialize(key))
        .transpose()?;

    let Some(halves) = arithmetics.split(&range, position.as_ref()) else {
        return Ok(None);
    };

    // The lower half still contains everything already processed.
    let lower_size = source.estimate_range_size(&halves.lower, cancel).await?;
    let upper_size = source.estimate_range_size(&halves.upper, cancel).await?;

    let lower: Range<String> = halves.lower.try_map(|key| serializer.serialize(key))?;
    let upper: Range<String> = halves.upper.try_map(|key| serializer.serialize(key))?;

    let mut update = partition.clone();
    update.updated = timestamp;
    update.last = lower.last;
    update.is_inclusive = lower.inclusive;
    update.remaining = lower_size.saturating_sub(partition.processed).max(1);
    update.split_requester = None;

    let insert = Partition::new(
        partition.job_id.clone(),
        upper,
        upper_size.max(1),
        timestamp,
    );

    Ok(Some(SplitPlan { update, insert }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keyshard_core::{Int64KeyArithmetics, Int64KeySerializer, JobId};

    struct Dense;

    #[async_trait]
    impl DataSource<i64> for Dense {
        async fn estimate_range_size(
            &self,
            range: &Range<i64>,
            _cancel: &CancellationToken,
        ) -> Result<u64> {
            let end = if range.inclusive { range.last + 1 } else { range.last };
            Ok(u64::try_from(end - range.first).unwrap_or(0))
        }

        async fn next_batch(
            &self,
            _range: &Range<i64>,
            _after: Option<&i64>,
            _limit: u32,
            _cancel: &CancellationToken,
        ) -> Result<Vec<i64>> {
            Ok(Vec::new())
        }
    }

    fn owned(first: i64, last: i64, position: Option<i64>) -> Partition {
        let mut partition = Partition::new(
            JobId::new("J1").unwrap(),
            Range::new(first.to_string(), last.to_string(), true),
            u64::try_from(last - first + 1).unwrap(),
            Utc::now(),
        );
        partition.owner = Some("W1".into());
        partition.split_requester = Some("W2".into());
        if let Some(p) = position {
            partition.position = Some(p.to_string());
            partition.processed = u64::try_from(p - first + 1).unwrap();
        }
        partition
    }

    async fn plan(partition: &Partition) -> Option<SplitPlan> {
        plan_split(
            partition,
            &Int64KeyArithmetics,
            &Int64KeySerializer,
            &Dense,
            Utc::now(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn splits_unprocessed_remainder() {
        let partition = owned(1, 100, Some(80));
        let plan = plan(&partition).await.unwrap();

        assert_eq!(plan.update.first, "1");
        assert_eq!(plan.update.last, "91");
        assert!(!plan.update.is_inclusive);
        assert_eq!(plan.update.owner.as_deref(), Some("W1"));
        assert_eq!(plan.update.split_requester, None);
        assert_eq!(plan.update.processed, 80);
        assert_eq!(plan.update.remaining, 10);

        assert_eq!(plan.insert.first, "91");
        assert_eq!(plan.insert.last, "100");
        assert!(plan.insert.is_inclusive);
        assert_eq!(plan.insert.owner, None);
        assert_eq!(plan.insert.processed, 0);
        assert_eq!(plan.insert.remaining, 10);
        assert_ne!(plan.insert.id, plan.update.id);
    }

    #[tokio::test]
    async fn refuses_when_one_key_left() {
        assert!(plan(&owned(1, 100, Some(99))).await.is_none());
        assert!(plan(&owned(1, 100, Some(100))).await.is_none());
    }

    #[tokio::test]
    async fn rejects_corrupt_position() {
        let mut partition = owned(1, 100, None);
        partition.position = Some("not-a-number".into());

        let result = plan_split(
            &partition,
            &Int64KeyArithmetics,
            &Int64KeySerializer,
            &Dense,
            Utc::now(),
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }
}
