//! End-to-end engine tests over the in-memory fixtures: partitioned
//! harvesting across simulated restarts, gap-driven continuation, and the
//! scheduler running grouped sibling jobs.

use std::time::Duration;

use anyhow::Result;
use chrono::{Datelike, Utc};
use tokio::time::sleep;

use folio_harvest::fixtures::{records, EngineFixtures, FailureKind};
use folio_harvest::{
    CancelFlag, CitationStore, GapConfig, HarvestJob, HarvestOutcome, HarvestScheduler,
    JobRepository, JobStatus, NewHarvestTarget, PartitionKey, ResumeStateRepository,
    SchedulerConfig, TargetRepository,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("folio_harvest=debug")
        .try_init();
}

async fn claim(fx: &EngineFixtures) -> HarvestJob {
    fx.jobs
        .claim_next_excluding(&[])
        .await
        .unwrap()
        .expect("a pending job to claim")
}

#[tokio::test(start_paused = true)]
async fn partitioned_harvest_survives_restart_and_self_heals() -> Result<()> {
    init_tracing();
    let fx = EngineFixtures::new();
    let current_year = Utc::now().year();

    let target_id = fx
        .targets
        .create(NewHarvestTarget {
            source_key: "gutenberg-2701".into(),
            query: "\"Moby-Dick\" Melville".into(),
            declared_total: 4000,
        })
        .await?;
    let base = "\"Moby-Dick\" Melville";

    // the two newest years have citations; everything older is empty
    let year_query = |y: i32| PartitionKey::Year(y).apply(base);
    fx.upstream.stub_pages(
        &year_query(current_year),
        vec![records("new", 0..30), records("new", 30..60)],
    );
    fx.upstream
        .stub_pages(&year_query(current_year - 1), vec![records("old", 0..25)]);

    // first invocation dies on page 1 of the newest year after its retry
    // budget: transient failures, one per attempt
    for _ in 0..=fx.config.page_max_retries {
        fx.upstream
            .push_failure(&year_query(current_year), 1, FailureKind::Transient);
    }

    let job_id = fx
        .jobs
        .enqueue(folio_harvest::NewHarvestJob::for_group(
            "gutenberg-2701",
            vec![target_id],
        ))
        .await?;
    let job = claim(&fx).await;
    assert_eq!(job.id, job_id);

    let outcome = fx.executor().execute(&job, &CancelFlag::new()).await?;
    assert_eq!(outcome, HarvestOutcome::Partial);
    fx.jobs.complete(job.id, outcome).await?;

    // exactly one page of progress is banked, cursor on the failed page
    let state = fx.resume.load(target_id).await?;
    assert_eq!(state.current_partition, Some(PartitionKey::Year(current_year)));
    assert_eq!(state.current_page_offset, 1);
    let target = fx.targets.get(target_id).await?.unwrap();
    assert_eq!(target.merged_total, 30);

    // the gap detector notices the shortfall and queues one continuation
    let detector = fx.gap_detector(GapConfig::default());
    assert_eq!(detector.run_once().await?, 1);
    assert_eq!(detector.run_once().await?, 0, "continuation must deduplicate");

    // "restart": a fresh executor picks up exactly where the cursor points
    fx.upstream.clear_calls();
    let continuation = claim(&fx).await;
    let outcome = fx
        .executor()
        .execute(&continuation, &CancelFlag::new())
        .await?;
    assert_eq!(outcome, HarvestOutcome::Completed);
    fx.jobs.complete(continuation.id, outcome).await?;

    // page 0 of the in-flight year is never re-fetched
    let calls = fx.upstream.calls();
    assert!(!calls.contains(&(year_query(current_year), 0)));
    assert_eq!(calls[0], (year_query(current_year), 1));

    // all records merged once; the two productive years completed; the
    // empty-year streak stopped the scan long before the floor year
    let target = fx.targets.get(target_id).await?.unwrap();
    assert_eq!(target.merged_total, 85);
    assert_eq!(fx.citations.count_for_target(target_id).await?, 85);

    let state = fx.resume.load(target_id).await?;
    assert!(state.is_completed(&PartitionKey::Year(current_year)));
    assert!(state.is_completed(&PartitionKey::Year(current_year - 1)));
    assert!(!state.is_completed(&PartitionKey::Year(fx.config.year_floor)));
    let expected_completed = 2 + fx.config.max_empty_years as usize;
    assert_eq!(state.completed_partitions.len(), expected_completed);

    // re-running the finished plan is a no-op: merge stays idempotent
    let rerun_id = fx
        .jobs
        .enqueue(folio_harvest::NewHarvestJob::for_group(
            "gutenberg-2701",
            vec![target_id],
        ))
        .await?;
    let rerun = claim(&fx).await;
    assert_eq!(rerun.id, rerun_id);
    fx.executor().execute(&rerun, &CancelFlag::new()).await?;
    let target = fx.targets.get(target_id).await?.unwrap();
    assert_eq!(target.merged_total, 85);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scheduler_heals_sibling_targets_with_one_grouped_job() -> Result<()> {
    init_tracing();
    let fx = EngineFixtures::new();

    // two editions of the same work, sharing the upstream entity
    let first = fx
        .targets
        .create(NewHarvestTarget {
            source_key: "scholar-cluster-77".into(),
            query: "\"To the Lighthouse\" 1927".into(),
            declared_total: 900,
        })
        .await?;
    let second = fx
        .targets
        .create(NewHarvestTarget {
            source_key: "scholar-cluster-77".into(),
            query: "\"To the Lighthouse\" 1955".into(),
            declared_total: 600,
        })
        .await?;

    fx.upstream.stub_pages(
        "\"To the Lighthouse\" 1927",
        vec![records("ed1", 0..30), records("ed1", 30..50)],
    );
    fx.upstream
        .stub_pages("\"To the Lighthouse\" 1955", vec![records("ed2", 0..40)]);

    let executor = fx.executor();
    let gap = fx.gap_detector(GapConfig::default());
    let scheduler = HarvestScheduler::new(
        fx.jobs.clone(),
        executor,
        gap,
        SchedulerConfig::default()
            .with_poll_interval(10)
            .with_start_stagger(1)
            .with_gap_scan_interval(3600),
    );
    let handle = scheduler.start();

    // no jobs enqueued by hand: the idle scheduler's gap scan must produce
    // exactly one grouped continuation and run it
    for _ in 0..2000 {
        let jobs = fx.jobs.all();
        if !jobs.is_empty() && jobs.iter().all(|j| j.status.is_terminal()) {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }

    let jobs = fx.jobs.all();
    assert_eq!(jobs.len(), 1, "siblings must share one continuation job");
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].target_ids.len(), 2);
    assert!(jobs[0].target_ids.contains(&first));
    assert!(jobs[0].target_ids.contains(&second));

    assert_eq!(fx.targets.get(first).await?.unwrap().merged_total, 50);
    assert_eq!(fx.targets.get(second).await?.unwrap().merged_total, 40);

    handle.shutdown().await?;
    Ok(())
}
