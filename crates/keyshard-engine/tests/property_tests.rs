//! Property-based tests for the coverage invariant.
//!
//! Random interleavings of progress reports and splits across workers must
//! never open a gap or an overlap in the job's key range.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;

use keyshard_core::{Int64KeyArithmetics, Int64KeySerializer};
use keyshard_engine::partition::{Partition, ProgressReport};
use keyshard_engine::split::plan_split;
use keyshard_engine::store::Store;
use keyshard_test_utils::{SequenceDataSource, TestContext, assert_exact_cover};

/// One step of the simulation.
#[derive(Debug, Clone)]
enum Step {
    /// Acquire whatever is available for the given worker.
    Acquire(usize),
    /// Advance the owner of the nth partition by some keys, then split.
    ProgressAndSplit { partition: usize, advance: u64 },
    /// Complete the nth partition.
    Complete(usize),
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0usize..4).prop_map(Step::Acquire),
        (0usize..16, 0u64..200).prop_map(|(partition, advance)| Step::ProgressAndSplit {
            partition,
            advance
        }),
        (0usize..16).prop_map(Step::Complete),
    ]
}

fn position_of(partition: &Partition) -> i64 {
    partition
        .position
        .as_deref()
        .map_or_else(|| partition.first.parse::<i64>().unwrap() - 1, |p| p.parse().unwrap())
}

fn end_of(partition: &Partition) -> i64 {
    let last: i64 = partition.last.parse().unwrap();
    if partition.is_inclusive { last } else { last - 1 }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn splits_never_break_coverage(
        first in -1_000i64..1_000,
        len in 1i64..5_000,
        steps in prop::collection::vec(arb_step(), 1..40),
    ) {
        runtime().block_on(async {
            let ctx = TestContext::new("J1");
            let range = ctx.schedule(first, first + len - 1).await;

            for step in steps {
                let partitions = ctx.partitions();
                match step {
                    Step::Acquire(worker) => {
                        ctx.store
                            .try_acquire_partition(
                                &ctx.job_id,
                                &format!("W{worker}"),
                                ctx.now(),
                                ctx.now(),
                                &ctx.cancel,
                            )
                            .await
                            .unwrap();
                    }
                    Step::ProgressAndSplit { partition, advance } => {
                        let Some(target) = partitions.get(partition % partitions.len()) else {
                            continue;
                        };
                        let Some(owner) = target.owner.clone() else { continue };
                        if target.is_completed {
                            continue;
                        }

                        let start = position_of(target);
                        let end = end_of(target);
                        let room = u64::try_from(end - start).unwrap();
                        let advance = advance.min(room.saturating_sub(1));
                        let position = start + i64::try_from(advance).unwrap();

                        let reported = if position > start {
                            ctx.store
                                .report_progress(
                                    &ProgressReport {
                                        id: target.id,
                                        owner,
                                        timestamp: ctx.now(),
                                        position: position.to_string(),
                                        processed: target.processed + advance,
                                        remaining: target.remaining.saturating_sub(advance),
                                        completed: false,
                                        throughput: 1.0,
                                        release_split_request: false,
                                    },
                                    &ctx.cancel,
                                )
                                .await
                                .unwrap()
                        } else {
                            target.clone()
                        };

                        if let Some(plan) = plan_split(
                            &reported,
                            &Int64KeyArithmetics,
                            &Int64KeySerializer,
                            &SequenceDataSource,
                            ctx.now(),
                            &ctx.cancel,
                        )
                        .await
                        .unwrap()
                        {
                            ctx.store
                                .insert_split_partition(&plan.update, &plan.insert, &ctx.cancel)
                                .await
                                .unwrap();
                        }
                    }
                    Step::Complete(partition) => {
                        let Some(target) = partitions.get(partition % partitions.len()) else {
                            continue;
                        };
                        let Some(owner) = target.owner.clone() else { continue };
                        ctx.store
                            .report_progress(
                                &ProgressReport {
                                    id: target.id,
                                    owner,
                                    timestamp: ctx.now(),
                                    position: end_of(target).to_string(),
                                    processed: target.processed + target.remaining,
                                    remaining: 0,
                                    completed: true,
                                    throughput: 1.0,
                                    release_split_request: false,
                                },
                                &ctx.cancel,
                            )
                            .await
                            .unwrap();
                    }
                }

                assert_exact_cover(&ctx.partitions(), &range);
            }
        });
    }
}
