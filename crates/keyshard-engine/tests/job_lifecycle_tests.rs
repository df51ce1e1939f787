//! Job state machine and completion convergence tests.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use keyshard_core::JobId;
use keyshard_engine::error::{EntityKind, Error, Result};
use keyshard_engine::job::{Job, JobState};
use keyshard_engine::lease::{DefaultLeasePolicy, LeasePolicy};
use keyshard_engine::partition::ProgressReport;
use keyshard_engine::store::Store;
use keyshard_test_utils::{
    TestContext, assert_all_completed, assert_unknown_identifier, job_settings, partition,
};

#[tokio::test]
async fn lifecycle_records_timestamps() -> Result<()> {
    let ctx = TestContext::new("J1");
    ctx.insert_job().await;

    let ready = ctx
        .store
        .mark_job_as_ready(&ctx.job_id, ctx.now(), &ctx.cancel)
        .await?;
    assert_eq!(ready.state, JobState::Ready);
    assert!(ready.started.is_none());

    let started = ctx
        .store
        .mark_job_as_started(&ctx.job_id, ctx.now(), &ctx.cancel)
        .await?;
    assert_eq!(started.state, JobState::Processing);
    assert_eq!(started.started, Some(ctx.now()));

    let completed = ctx
        .store
        .mark_job_as_completed(&ctx.job_id, ctx.now(), &ctx.cancel)
        .await?;
    assert_eq!(completed.state, JobState::Completed);
    assert_eq!(completed.completed, Some(ctx.now()));
    assert!(completed.error.is_none());
    Ok(())
}

#[tokio::test]
async fn terminal_states_are_final() -> Result<()> {
    let ctx = TestContext::new("J1");
    ctx.insert_job().await;
    let failed = ctx
        .store
        .mark_job_as_failed(&ctx.job_id, ctx.now(), "source unavailable", &ctx.cancel)
        .await?;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.error.as_deref(), Some("source unavailable"));
    assert!(failed.completed.is_some());

    let err = ctx
        .store
        .mark_job_as_ready(&ctx.job_id, ctx.now(), &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidStateTransition {
            from: JobState::Failed,
            to: JobState::Ready,
        }
    ));

    let err = ctx
        .store
        .mark_job_as_failed(&ctx.job_id, ctx.now(), "again", &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));

    let stored = ctx.job().await;
    assert_eq!(stored.error.as_deref(), Some("source unavailable"));
    Ok(())
}

#[tokio::test]
async fn transitions_on_unknown_job_fail() {
    let ctx = TestContext::new("J1");
    let missing = JobId::new("missing").unwrap();

    assert_unknown_identifier(
        &ctx.store
            .mark_job_as_started(&missing, ctx.now(), &ctx.cancel)
            .await,
    );
    assert_unknown_identifier(&ctx.store.retrieve_job(&missing, &ctx.cancel).await);
    assert_unknown_identifier(
        &ctx.store
            .count_incomplete_partitions(&missing, &ctx.cancel)
            .await,
    );
}

#[tokio::test]
async fn duplicate_job_and_orphan_partition_are_rejected() -> Result<()> {
    let ctx = TestContext::new("J1");
    ctx.insert_job().await;

    let duplicate = Job::new(ctx.job_id.clone(), &job_settings(5), ctx.now());
    let err = ctx
        .store
        .insert_job(&duplicate, &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DuplicateIdentifier {
            kind: EntityKind::Job,
            ..
        }
    ));

    let orphan = partition(&JobId::new("other")?, "a", "z", 26, ctx.now());
    let err = ctx
        .store
        .insert_partition(&orphan, &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidReference { .. }));

    let p = partition(&ctx.job_id, "a", "z", 26, ctx.now());
    ctx.store.insert_partition(&p, &ctx.cancel).await?;
    let err = ctx
        .store
        .insert_partition(&p, &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DuplicateIdentifier {
            kind: EntityKind::Partition,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn completing_every_partition_converges() -> Result<()> {
    let ctx = TestContext::new("J1");
    ctx.insert_job().await;
    for (first, last) in [("a", "f"), ("g", "m"), ("n", "s"), ("t", "z")] {
        ctx.store
            .insert_partition(&partition(&ctx.job_id, first, last, 6, ctx.now()), &ctx.cancel)
            .await?;
    }
    ctx.store
        .mark_job_as_ready(&ctx.job_id, ctx.now(), &ctx.cancel)
        .await?;
    let job = ctx.job().await;
    assert_eq!(
        ctx.store
            .count_incomplete_partitions(&ctx.job_id, &ctx.cancel)
            .await?,
        4
    );

    let mut rounds = 0;
    loop {
        let active = DefaultLeasePolicy.active_threshold(ctx.now(), &job);
        let Some(acquired) = ctx
            .store
            .try_acquire_partition(&ctx.job_id, "W1", ctx.now(), active, &ctx.cancel)
            .await?
        else {
            break;
        };
        if rounds == 0 {
            ctx.store
                .mark_job_as_started(&ctx.job_id, ctx.now(), &ctx.cancel)
                .await?;
        }
        rounds += 1;

        ctx.store
            .report_progress(
                &ProgressReport {
                    id: acquired.id,
                    owner: "W1".into(),
                    timestamp: ctx.now(),
                    position: acquired.last.clone(),
                    processed: 6,
                    remaining: 0,
                    completed: true,
                    throughput: 6.0,
                    release_split_request: false,
                },
                &ctx.cancel,
            )
            .await?;
    }

    assert_eq!(rounds, 4);
    assert_eq!(
        ctx.store
            .count_incomplete_partitions(&ctx.job_id, &ctx.cancel)
            .await?,
        0
    );
    assert_all_completed(&ctx.partitions());

    let completed = ctx
        .store
        .mark_job_as_completed(&ctx.job_id, ctx.now(), &ctx.cancel)
        .await?;
    assert_eq!(completed.state, JobState::Completed);
    assert_eq!(ctx.store.count_jobs(&ctx.cancel).await?, 1);
    Ok(())
}
