//! Two-phase split protocol tests: request by an idle worker, fulfilment by
//! the owner, and atomicity of the fulfilment.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use keyshard_core::{Int64KeyArithmetics, Int64KeySerializer, JobId};
use keyshard_engine::error::Result;
use keyshard_engine::lease::{DefaultLeasePolicy, LeasePolicy};
use keyshard_engine::partition::ProgressReport;
use keyshard_engine::split::plan_split;
use keyshard_engine::store::Store;
use keyshard_test_utils::{
    SequenceDataSource, TestContext, assert_exact_cover, assert_lock_conflict,
    assert_unknown_identifier, partition,
};

#[tokio::test]
async fn idle_worker_split_hands_upper_half_to_requester() -> Result<()> {
    let ctx = TestContext::new("J1");
    ctx.insert_job().await;
    let p0 = partition(&ctx.job_id, "a", "z", 1000, ctx.now());
    ctx.store.insert_partition(&p0, &ctx.cancel).await?;
    ctx.store
        .mark_job_as_ready(&ctx.job_id, ctx.now(), &ctx.cancel)
        .await?;
    let job = ctx.job().await;
    let active = DefaultLeasePolicy.active_threshold(ctx.now(), &job);

    let owned = ctx
        .store
        .try_acquire_partition(&ctx.job_id, "W1", ctx.now(), active, &ctx.cancel)
        .await?
        .expect("P0");
    assert_eq!(owned.owner.as_deref(), Some("W1"));

    assert!(
        ctx.store
            .try_request_split(&ctx.job_id, "W2", active, &ctx.cancel)
            .await?
    );
    let requested = ctx.store.retrieve_partition(p0.id, &ctx.cancel).await?;
    assert_eq!(requested.split_requester.as_deref(), Some("W2"));

    // W1 reports progress up to "m" and sees the pending request.
    ctx.clock.advance(Duration::from_secs(1));
    let reported = ctx
        .store
        .report_progress(
            &ProgressReport {
                id: p0.id,
                owner: "W1".into(),
                timestamp: ctx.now(),
                position: "m".into(),
                processed: 500,
                remaining: 500,
                completed: false,
                throughput: 50.0,
                release_split_request: false,
            },
            &ctx.cancel,
        )
        .await?;
    assert_eq!(reported.split_requester.as_deref(), Some("W2"));

    let mut update = reported.clone();
    update.last = "m".into();
    update.remaining = 1;
    let p1 = partition(&ctx.job_id, "n", "z", 499, ctx.now());
    ctx.store
        .insert_split_partition(&update, &p1, &ctx.cancel)
        .await?;

    assert!(
        !ctx.store
            .is_split_request_pending(&ctx.job_id, "W2", &ctx.cancel)
            .await?
    );

    let acquired = ctx
        .store
        .try_acquire_partition(&ctx.job_id, "W2", ctx.now(), active, &ctx.cancel)
        .await?
        .expect("P1");
    assert_eq!(acquired.id, p1.id);
    assert_eq!(acquired.first, "n");
    assert_eq!(acquired.last, "z");

    let shrunk = ctx.store.retrieve_partition(p0.id, &ctx.cancel).await?;
    assert_eq!(shrunk.first, "a");
    assert_eq!(shrunk.last, "m");
    assert_eq!(shrunk.owner.as_deref(), Some("W1"));
    assert_eq!(shrunk.split_requester, None);
    assert_eq!(shrunk.processed + shrunk.remaining + acquired.remaining, 1000);
    Ok(())
}

#[tokio::test]
async fn planned_split_preserves_coverage() -> Result<()> {
    let ctx = TestContext::new("J1");
    let range = ctx.schedule(1, 1_000).await;
    let job = ctx.job().await;
    let active = DefaultLeasePolicy.active_threshold(ctx.now(), &job);

    let owned = ctx
        .store
        .try_acquire_partition(&ctx.job_id, "W1", ctx.now(), active, &ctx.cancel)
        .await?
        .expect("partition");
    let reported = ctx
        .store
        .report_progress(
            &ProgressReport {
                id: owned.id,
                owner: "W1".into(),
                timestamp: ctx.now(),
                position: "200".into(),
                processed: 200,
                remaining: 800,
                completed: false,
                throughput: 0.0,
                release_split_request: false,
            },
            &ctx.cancel,
        )
        .await?;

    let plan = plan_split(
        &reported,
        &Int64KeyArithmetics,
        &Int64KeySerializer,
        &SequenceDataSource,
        ctx.now(),
        &ctx.cancel,
    )
    .await?
    .expect("splittable");
    ctx.store
        .insert_split_partition(&plan.update, &plan.insert, &ctx.cancel)
        .await?;

    let partitions = ctx.partitions();
    assert_eq!(partitions.len(), 2);
    assert_exact_cover(&partitions, &range);

    let shrunk = ctx.store.retrieve_partition(owned.id, &ctx.cancel).await?;
    assert_eq!(shrunk.last, "601");
    assert!(!shrunk.is_inclusive);
    assert_eq!(shrunk.remaining, 400);
    let inserted = ctx.store.retrieve_partition(plan.insert.id, &ctx.cancel).await?;
    assert_eq!(inserted.first, "601");
    assert_eq!(inserted.remaining, 400);
    assert_eq!(inserted.owner, None);
    Ok(())
}

#[tokio::test]
async fn split_after_lease_loss_leaves_no_new_partition() -> Result<()> {
    let ctx = TestContext::new("J1");
    let range = ctx.schedule(1, 1_000).await;
    let job = ctx.job().await;

    let owned = ctx
        .store
        .try_acquire_partition(&ctx.job_id, "W1", ctx.now(), ctx.now(), &ctx.cancel)
        .await?
        .expect("partition");

    ctx.clock.advance(job.timeout + job.clock_drift + Duration::from_secs(1));
    ctx.store
        .try_acquire_partition(
            &ctx.job_id,
            "W2",
            ctx.now(),
            DefaultLeasePolicy.active_threshold(ctx.now(), &job),
            &ctx.cancel,
        )
        .await?
        .expect("reclaimed");

    let plan = plan_split(
        &owned,
        &Int64KeyArithmetics,
        &Int64KeySerializer,
        &SequenceDataSource,
        ctx.now(),
        &ctx.cancel,
    )
    .await?
    .expect("splittable");
    let result = ctx
        .store
        .insert_split_partition(&plan.update, &plan.insert, &ctx.cancel)
        .await;

    assert_lock_conflict(&result);
    let partitions = ctx.partitions();
    assert_eq!(partitions.len(), 1);
    assert_exact_cover(&partitions, &range);
    Ok(())
}

#[tokio::test]
async fn split_of_vanished_partition_is_unknown() -> Result<()> {
    let ctx = TestContext::new("J1");
    ctx.insert_job().await;
    let mut ghost = partition(&ctx.job_id, "a", "z", 26, ctx.now());
    ghost.owner = Some("W1".into());
    let insert = partition(&ctx.job_id, "n", "z", 13, ctx.now());

    let result = ctx
        .store
        .insert_split_partition(&ghost, &insert, &ctx.cancel)
        .await;

    assert_unknown_identifier(&result);
    assert!(ctx.partitions().is_empty());
    Ok(())
}

#[tokio::test]
async fn completion_clears_pending_split_request() -> Result<()> {
    let ctx = TestContext::new("J1");
    ctx.schedule(1, 100).await;
    let job = ctx.job().await;
    let active = DefaultLeasePolicy.active_threshold(ctx.now(), &job);

    let owned = ctx
        .store
        .try_acquire_partition(&ctx.job_id, "W1", ctx.now(), active, &ctx.cancel)
        .await?
        .expect("partition");
    assert!(
        ctx.store
            .try_request_split(&ctx.job_id, "W2", active, &ctx.cancel)
            .await?
    );

    let completed = ctx
        .store
        .report_progress(
            &ProgressReport {
                id: owned.id,
                owner: "W1".into(),
                timestamp: ctx.now(),
                position: "100".into(),
                processed: 100,
                remaining: 0,
                completed: true,
                throughput: 0.0,
                release_split_request: false,
            },
            &ctx.cancel,
        )
        .await?;

    assert!(completed.is_completed);
    assert_eq!(completed.remaining, 0);
    assert_eq!(completed.split_requester, None);
    assert!(
        !ctx.store
            .is_split_request_pending(&ctx.job_id, "W2", &ctx.cancel)
            .await?
    );
    Ok(())
}

#[tokio::test]
async fn split_request_ignores_stale_partitions() -> Result<()> {
    let ctx = TestContext::new("J1");
    ctx.schedule(1, 100).await;
    let job = ctx.job().await;
    ctx.store
        .try_acquire_partition(&ctx.job_id, "W1", ctx.now(), ctx.now(), &ctx.cancel)
        .await?
        .expect("partition");

    ctx.clock.advance(Duration::from_secs(120));
    let active = DefaultLeasePolicy.active_threshold(ctx.now(), &job);
    assert!(
        !ctx.store
            .try_request_split(&ctx.job_id, "W2", active, &ctx.cancel)
            .await?
    );
    Ok(())
}

#[tokio::test]
async fn split_operations_on_unknown_job_fail() {
    let ctx = TestContext::new("J1");
    let missing = JobId::new("missing").unwrap();

    let result = ctx
        .store
        .try_request_split(&missing, "W2", ctx.now(), &ctx.cancel)
        .await;
    assert_unknown_identifier(&result);

    let result = ctx
        .store
        .is_split_request_pending(&missing, "W2", &ctx.cancel)
        .await;
    assert_unknown_identifier(&result);
}
