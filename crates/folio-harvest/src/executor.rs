//! Harvest execution.
//!
//! The executor drives one job through its targets' remaining partitions,
//! paging through upstream results. The cadence per page is fixed: fetch,
//! audit-log, merge, bump the merged counter by the merge delta, then
//! advance and persist the resume cursor — in that order, so a crash can
//! lose at most the page in flight and never marks a page seen before its
//! records are durable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use folio_core::{
    CitationStore, Error, HarvestConfig, HarvestJob, HarvestOutcome, HarvestTarget, JobProgress,
    JobRepository, NewQueryLogEntry, PartitionKey, PartitionScheme, QueryLogRepository, Result,
    ResumeState, ResumeStateRepository, TargetRepository, UpstreamSearch,
};

use crate::planner;

/// Cooperative cancellation flag shared between the scheduler and a running
/// job. Cancellation is checkpointed-stop: the executor stops issuing new
/// page requests promptly but keeps everything already persisted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Exponential backoff for transient upstream errors: 2^attempt seconds
/// plus up to 250ms of jitter so retrying workers don't re-align.
pub fn backoff_duration(attempt: u32) -> Duration {
    let base = Duration::from_secs(2u64.pow(attempt.min(6)));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    base + jitter
}

/// Callback invoked after every merged page with the job's live progress.
pub type ProgressCallback = Box<dyn Fn(Uuid, &JobProgress) + Send + Sync>;

/// Outcome of paging one partition to its stop condition.
enum PartitionRun {
    /// The partition is drained (empty page or stale-page limit).
    Drained { results_seen: i64 },
    /// The cancel flag was observed; stop without completing the partition.
    CancelRequested,
}

/// Outcome of harvesting one target within a job.
enum TargetRun {
    Completed,
    Partial,
}

/// Drives harvest jobs against the upstream source.
pub struct HarvestExecutor {
    targets: Arc<dyn TargetRepository>,
    citations: Arc<dyn CitationStore>,
    resume: Arc<dyn ResumeStateRepository>,
    query_log: Arc<dyn QueryLogRepository>,
    jobs: Arc<dyn JobRepository>,
    upstream: Arc<dyn UpstreamSearch>,
    config: HarvestConfig,
    progress_callback: Option<ProgressCallback>,
}

impl HarvestExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        targets: Arc<dyn TargetRepository>,
        citations: Arc<dyn CitationStore>,
        resume: Arc<dyn ResumeStateRepository>,
        query_log: Arc<dyn QueryLogRepository>,
        jobs: Arc<dyn JobRepository>,
        upstream: Arc<dyn UpstreamSearch>,
        config: HarvestConfig,
    ) -> Self {
        Self {
            targets,
            citations,
            resume,
            query_log,
            jobs,
            upstream,
            config,
            progress_callback: None,
        }
    }

    /// Set a callback receiving per-page progress snapshots.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Uuid, &JobProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Execute one job: every target it carries, every partition still owed.
    ///
    /// Transient upstream trouble (after the per-page retry budget) and
    /// cancellation end the invocation with [`HarvestOutcome::Partial`];
    /// persisted progress is always kept and the gap detector re-enqueues
    /// the remainder later. Persistence and configuration errors propagate
    /// as job failures.
    pub async fn execute(&self, job: &HarvestJob, cancel: &CancelFlag) -> Result<HarvestOutcome> {
        let mut any_partial = false;

        for &target_id in &job.target_ids {
            if cancel.is_cancelled() {
                return Ok(HarvestOutcome::Partial);
            }

            let target = self
                .targets
                .get(target_id)
                .await?
                .ok_or(Error::TargetNotFound(target_id))?;

            if target.harvest_paused {
                debug!(
                    subsystem = "harvest",
                    target_id = %target_id,
                    "Target is paused, skipping"
                );
                continue;
            }

            match self.harvest_target(job, &target, cancel).await? {
                TargetRun::Completed => {}
                TargetRun::Partial => any_partial = true,
            }
        }

        Ok(if any_partial || cancel.is_cancelled() {
            HarvestOutcome::Partial
        } else {
            HarvestOutcome::Completed
        })
    }

    async fn harvest_target(
        &self,
        job: &HarvestJob,
        target: &HarvestTarget,
        cancel: &CancelFlag,
    ) -> Result<TargetRun> {
        let mut state = self.resume.load(target.id).await?;
        let plan = planner::plan(
            target,
            &state,
            target.scheme_override,
            &self.config,
            Utc::now().year(),
        );

        if plan.partitions.is_empty() {
            debug!(
                subsystem = "harvest",
                target_id = %target.id,
                "No partitions remaining"
            );
            return Ok(TargetRun::Completed);
        }
        state.scheme = plan.scheme;

        debug!(
            subsystem = "harvest",
            target_id = %target.id,
            scheme = %plan.scheme,
            remaining = plan.partitions.len(),
            "Harvesting target"
        );

        let mut merged_total = target.merged_total;
        let mut declared_total = target.declared_total;
        let mut empty_year_streak = 0u32;

        for key in &plan.partitions {
            if cancel.is_cancelled() {
                return Ok(TargetRun::Partial);
            }

            let run = self
                .harvest_partition(
                    job,
                    target,
                    key,
                    &mut state,
                    &mut merged_total,
                    &mut declared_total,
                    cancel,
                )
                .await;

            match run {
                Ok(PartitionRun::CancelRequested) => return Ok(TargetRun::Partial),
                Ok(PartitionRun::Drained { results_seen }) => {
                    state.complete_partition(key);
                    self.resume.save(target.id, &state).await?;
                    debug!(
                        subsystem = "harvest",
                        target_id = %target.id,
                        partition = %key,
                        result_count = results_seen,
                        "Partition completed"
                    );

                    if plan.scheme == PartitionScheme::ByYear {
                        if results_seen == 0 {
                            empty_year_streak += 1;
                            if empty_year_streak >= self.config.max_empty_years {
                                debug!(
                                    subsystem = "harvest",
                                    target_id = %target.id,
                                    streak = empty_year_streak,
                                    "Consecutive empty years, treating earlier years as exhausted"
                                );
                                break;
                            }
                        } else {
                            empty_year_streak = 0;
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    // retry budget exhausted; the persisted cursor already
                    // points at the failed page, auto-resume takes it from here
                    warn!(
                        subsystem = "harvest",
                        target_id = %target.id,
                        partition = %key,
                        error = %e,
                        "Transient upstream failure, ending invocation partial"
                    );
                    return Ok(TargetRun::Partial);
                }
                Err(Error::UpstreamPermanent(msg)) => {
                    // upstream rejects this sub-query outright; re-issuing it
                    // later would fail identically, so retire the partition
                    warn!(
                        subsystem = "harvest",
                        target_id = %target.id,
                        partition = %key,
                        error = %msg,
                        "Upstream rejected partition query, skipping partition"
                    );
                    state.complete_partition(key);
                    self.resume.save(target.id, &state).await?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(TargetRun::Completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn harvest_partition(
        &self,
        job: &HarvestJob,
        target: &HarvestTarget,
        key: &PartitionKey,
        state: &mut ResumeState,
        merged_total: &mut i64,
        declared_total: &mut i64,
        cancel: &CancelFlag,
    ) -> Result<PartitionRun> {
        let query = key.apply(&target.query);
        let mut page = state.start_offset(key);
        let mut stale_streak = 0u32;
        let mut results_seen = 0i64;

        loop {
            if cancel.is_cancelled() {
                return Ok(PartitionRun::CancelRequested);
            }

            let fetched = self.fetch_page(job, target, key, &query, page).await?;

            if matches!(key, PartitionKey::All)
                && fetched.declared_total > 0
                && fetched.declared_total != *declared_total
            {
                self.targets
                    .set_declared_total(target.id, fetched.declared_total)
                    .await?;
                *declared_total = fetched.declared_total;
            }

            if fetched.records.is_empty() {
                break;
            }
            results_seen += fetched.records.len() as i64;

            let new_count = self.citations.merge_page(target.id, &fetched.records).await?;
            if new_count > 0 {
                self.targets.add_merged(target.id, new_count).await?;
                *merged_total += new_count as i64;
            }

            page += 1;
            state.record_page(key, page);
            self.resume.save(target.id, state).await?;

            self.report_progress(
                job.id,
                &JobProgress {
                    merged_total: *merged_total,
                    declared_total: *declared_total,
                    current_partition: Some(key.storage_key()),
                    current_page: page,
                },
            )
            .await;

            if new_count == 0 {
                // the page had results but every record was already merged;
                // near partition boundaries upstream re-serves neighbors
                stale_streak += 1;
                if stale_streak >= self.config.max_stale_pages {
                    debug!(
                        subsystem = "harvest",
                        target_id = %target.id,
                        partition = %key,
                        page,
                        "Only already-merged records, partition drained"
                    );
                    break;
                }
            } else {
                stale_streak = 0;
            }
        }

        Ok(PartitionRun::Drained { results_seen })
    }

    /// Fetch one page with bounded retries, writing an audit entry for every
    /// attempt whether it succeeded or not.
    async fn fetch_page(
        &self,
        job: &HarvestJob,
        target: &HarvestTarget,
        key: &PartitionKey,
        query: &str,
        page: i64,
    ) -> Result<folio_core::SearchPage> {
        let mut attempt = 0u32;
        loop {
            let outcome = self.upstream.search(query, page).await;

            let (results_count, success, error_message) = match &outcome {
                Ok(p) => (p.records.len() as i64, true, None),
                Err(e) => (0, false, Some(e.to_string())),
            };
            self.query_log
                .append(NewQueryLogEntry {
                    target_id: target.id,
                    job_id: Some(job.id),
                    query: query.to_string(),
                    partition_type: key.scheme(),
                    partition_value: key.value(),
                    page_number: page,
                    results_count,
                    success,
                    error_message,
                })
                .await?;

            match outcome {
                Ok(p) => return Ok(p),
                Err(e) if e.is_retryable() && attempt < self.config.page_max_retries => {
                    attempt += 1;
                    debug!(
                        subsystem = "harvest",
                        target_id = %target.id,
                        partition = %key,
                        page,
                        attempt,
                        max_retries = self.config.page_max_retries,
                        error = %e,
                        "Transient upstream error, backing off"
                    );
                    sleep(backoff_duration(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn report_progress(&self, job_id: Uuid, progress: &JobProgress) {
        // progress is advisory; a genuinely broken store surfaces at the
        // next resume-state save
        if let Err(e) = self.jobs.update_progress(job_id, progress).await {
            warn!(
                subsystem = "harvest",
                job_id = %job_id,
                error = %e,
                "Failed to persist job progress"
            );
        }
        if let Some(callback) = &self.progress_callback {
            callback(job_id, progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{
        record, records, EngineFixtures, FailureKind, MemoryJobRepository,
    };
    use folio_core::{JobStatus, NewHarvestJob, NewHarvestTarget};
    use std::sync::Mutex;

    const BASE_QUERY: &str = "\"Orlando\" Woolf";

    async fn fresh_target(fx: &EngineFixtures, declared_total: i64) -> Uuid {
        fx.targets
            .create(NewHarvestTarget {
                source_key: "cluster-1".into(),
                query: BASE_QUERY.into(),
                declared_total,
            })
            .await
            .unwrap()
    }

    async fn job_for(fx: &EngineFixtures, target_id: Uuid) -> HarvestJob {
        let target = fx.targets.get(target_id).await.unwrap().unwrap();
        let id = fx.jobs.enqueue(NewHarvestJob::for_target(&target)).await.unwrap();
        fx.jobs.claim_next_excluding(&[]).await.unwrap().unwrap();
        fx.jobs.get(id).await.unwrap().unwrap()
    }

    #[test]
    fn backoff_grows_exponentially_with_bounded_jitter() {
        for attempt in 1..=3 {
            let d = backoff_duration(attempt);
            let base = Duration::from_secs(2u64.pow(attempt));
            assert!(d >= base);
            assert!(d < base + Duration::from_millis(250));
        }
        // the exponent is clamped so the cap cannot overflow
        assert!(backoff_duration(40) < Duration::from_secs(65));
    }

    #[test]
    fn cancel_flag_round_trip() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn single_partition_harvest_merges_all_pages() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 40).await;
        fx.upstream
            .stub_pages(BASE_QUERY, vec![records("a", 0..20), records("a", 20..40)]);
        fx.upstream.stub_declared_total(BASE_QUERY, 40);

        let job = job_for(&fx, target_id).await;
        let outcome = fx.executor().execute(&job, &CancelFlag::new()).await.unwrap();

        assert_eq!(outcome, HarvestOutcome::Completed);
        let target = fx.targets.get(target_id).await.unwrap().unwrap();
        assert_eq!(target.merged_total, 40);
        assert_eq!(fx.citations.count_for_target(target_id).await.unwrap(), 40);

        let state = fx.resume.load(target_id).await.unwrap();
        assert!(state.is_completed(&PartitionKey::All));
        assert!(state.current_partition.is_none());
        assert_eq!(state.current_page_offset, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_state_is_persisted_after_every_page() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 60).await;
        fx.upstream.stub_pages(
            BASE_QUERY,
            vec![
                records("a", 0..20),
                records("a", 20..40),
                records("a", 40..60),
            ],
        );

        // fail hard on page 2 after the retry budget, leaving the job partial
        let executor = fx.executor();
        for _ in 0..=fx.config.page_max_retries {
            fx.upstream.push_failure(BASE_QUERY, 2, FailureKind::Transient);
        }

        let job = job_for(&fx, target_id).await;
        let outcome = executor.execute(&job, &CancelFlag::new()).await.unwrap();
        assert_eq!(outcome, HarvestOutcome::Partial);

        // two pages merged, cursor points at the failed page, not 0 and not 3
        let state = fx.resume.load(target_id).await.unwrap();
        assert_eq!(state.current_partition, Some(PartitionKey::All));
        assert_eq!(state.current_page_offset, 2);
        let target = fx.targets.get(target_id).await.unwrap().unwrap();
        assert_eq!(target.merged_total, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resumes_at_persisted_page() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 60).await;
        fx.upstream.stub_pages(
            BASE_QUERY,
            vec![
                records("a", 0..20),
                records("a", 20..40),
                records("a", 40..60),
            ],
        );
        for _ in 0..=fx.config.page_max_retries {
            fx.upstream.push_failure(BASE_QUERY, 2, FailureKind::Transient);
        }

        let job = job_for(&fx, target_id).await;
        assert_eq!(
            fx.executor().execute(&job, &CancelFlag::new()).await.unwrap(),
            HarvestOutcome::Partial
        );
        fx.upstream.clear_calls();

        // a fresh invocation picks up exactly at page 2
        let job2 = job_for(&fx, target_id).await;
        let outcome = fx.executor().execute(&job2, &CancelFlag::new()).await.unwrap();
        assert_eq!(outcome, HarvestOutcome::Completed);

        let pages: Vec<i64> = fx.upstream.calls().into_iter().map(|(_, p)| p).collect();
        assert_eq!(pages.first(), Some(&2));
        assert!(!pages.contains(&0));
        assert!(!pages.contains(&1));

        let target = fx.targets.get(target_id).await.unwrap().unwrap();
        assert_eq!(target.merged_total, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn merge_is_idempotent_across_reruns() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 20).await;
        fx.upstream
            .stub_pages(BASE_QUERY, vec![records("a", 0..20)]);

        let job = job_for(&fx, target_id).await;
        fx.executor().execute(&job, &CancelFlag::new()).await.unwrap();
        let merged_after_first = fx.targets.get(target_id).await.unwrap().unwrap().merged_total;

        // simulate a planner bug re-queuing the completed partition
        let mut state = fx.resume.load(target_id).await.unwrap();
        state.completed_partitions.clear();
        fx.resume.save(target_id, &state).await.unwrap();

        let job2 = job_for(&fx, target_id).await;
        fx.executor().execute(&job2, &CancelFlag::new()).await.unwrap();

        let target = fx.targets.get(target_id).await.unwrap().unwrap();
        assert_eq!(target.merged_total, merged_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pages_stop_partition_without_completing_target_count() {
        // pages keep returning records, but none are new after page 0
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 20).await;
        fx.upstream.stub_pages(
            BASE_QUERY,
            vec![
                records("a", 0..10),
                records("a", 0..10),
                records("a", 0..10),
                records("a", 0..10),
            ],
        );

        let job = job_for(&fx, target_id).await;
        let outcome = fx.executor().execute(&job, &CancelFlag::new()).await.unwrap();
        assert_eq!(outcome, HarvestOutcome::Completed);

        let target = fx.targets.get(target_id).await.unwrap().unwrap();
        assert_eq!(target.merged_total, 10);

        // page 0 new, pages 1 and 2 stale (max_stale_pages = 2), page 3 never fetched
        let pages: Vec<i64> = fx.upstream.calls().into_iter().map(|(_, p)| p).collect();
        assert_eq!(pages, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn by_year_scheme_stops_after_consecutive_empty_years() {
        let fx = EngineFixtures::new();
        let current_year = Utc::now().year();
        let config = fx.config.clone().with_year_floor(current_year - 9);
        let target_id = fresh_target(&fx, 5000).await;

        // only the newest year has results; everything older is empty
        fx.upstream.stub_pages(
            &PartitionKey::Year(current_year).apply(BASE_QUERY),
            vec![records("y", 0..5)],
        );

        let job = job_for(&fx, target_id).await;
        let executor = fx.executor_with_config(config.clone());
        let outcome = executor.execute(&job, &CancelFlag::new()).await.unwrap();
        assert_eq!(outcome, HarvestOutcome::Completed);

        let state = fx.resume.load(target_id).await.unwrap();
        // newest year + the empty-year streak are completed; the tail is not
        assert!(state.is_completed(&PartitionKey::Year(current_year)));
        let completed_years = state.completed_partitions.len();
        assert_eq!(completed_years, 1 + config.max_empty_years as usize);
        assert!(!state.is_completed(&PartitionKey::Year(current_year - 9)));
    }

    #[tokio::test(start_paused = true)]
    async fn scheme_override_forces_letter_partitions() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 50_000).await;
        fx.targets
            .set_scheme_override(target_id, Some(PartitionScheme::ByLetter))
            .await
            .unwrap();
        fx.upstream.stub_pages(
            &PartitionKey::Letter('a').apply(BASE_QUERY),
            vec![records("a", 0..15)],
        );

        let job = job_for(&fx, target_id).await;
        let outcome = fx.executor().execute(&job, &CancelFlag::new()).await.unwrap();
        assert_eq!(outcome, HarvestOutcome::Completed);

        // all 26 letter partitions scanned; only 'a' had results, and the
        // empty-year early stop does not apply to letter partitions
        let state = fx.resume.load(target_id).await.unwrap();
        assert_eq!(state.scheme, PartitionScheme::ByLetter);
        assert_eq!(state.completed_partitions.len(), 26);
        let target = fx.targets.get(target_id).await.unwrap().unwrap();
        assert_eq!(target.merged_total, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_upstream_error_skips_partition_and_continues() {
        let fx = EngineFixtures::new();
        let current_year = Utc::now().year();
        let config = fx.config.clone().with_year_floor(current_year - 1);
        let target_id = fresh_target(&fx, 5000).await;

        fx.upstream.push_failure(
            &PartitionKey::Year(current_year).apply(BASE_QUERY),
            0,
            FailureKind::Permanent,
        );
        fx.upstream.stub_pages(
            &PartitionKey::Year(current_year - 1).apply(BASE_QUERY),
            vec![records("y", 0..8)],
        );

        let job = job_for(&fx, target_id).await;
        let outcome = fx
            .executor_with_config(config)
            .execute(&job, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(outcome, HarvestOutcome::Completed);

        // the rejected year is retired, the next year still harvested
        let state = fx.resume.load(target_id).await.unwrap();
        assert!(state.is_completed(&PartitionKey::Year(current_year)));
        assert!(state.is_completed(&PartitionKey::Year(current_year - 1)));
        let target = fx.targets.get(target_id).await.unwrap().unwrap();
        assert_eq!(target.merged_total, 8);

        // and the rejection is on the audit log
        let entries = fx.query_log.list_for_target(target_id, 50).await.unwrap();
        assert!(entries.iter().any(|e| !e.success && e.error_message.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn every_upstream_attempt_is_audit_logged() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 10).await;
        fx.upstream.push_failure(BASE_QUERY, 0, FailureKind::Transient);
        fx.upstream.stub_pages(BASE_QUERY, vec![records("a", 0..10)]);

        let job = job_for(&fx, target_id).await;
        fx.executor().execute(&job, &CancelFlag::new()).await.unwrap();

        let entries = fx.query_log.list_for_target(target_id, 50).await.unwrap();
        // page 0 failed attempt + page 0 retry + page 1 empty probe
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.iter().filter(|e| !e.success).count(), 1);
        assert!(entries.iter().all(|e| e.job_id == Some(job.id)));
        assert!(entries.iter().all(|e| e.query == BASE_QUERY));
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_is_fatal_to_job() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 10).await;
        fx.upstream.stub_pages(BASE_QUERY, vec![records("a", 0..10)]);
        fx.resume.fail_saves(true);

        let job = job_for(&fx, target_id).await;
        let result = fx.executor().execute(&job, &CancelFlag::new()).await;
        assert!(matches!(result, Err(Error::Database(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_promptly_and_keeps_progress() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 60).await;
        fx.upstream.stub_pages(
            BASE_QUERY,
            vec![
                records("a", 0..20),
                records("a", 20..40),
                records("a", 40..60),
            ],
        );

        let cancel = CancelFlag::new();
        let cancel_after_first_page = cancel.clone();
        let pages_seen = Arc::new(Mutex::new(0u32));
        let pages_counter = pages_seen.clone();

        let executor = fx.executor().with_progress_callback(move |_, _| {
            let mut n = pages_counter.lock().unwrap();
            *n += 1;
            if *n == 1 {
                cancel_after_first_page.cancel();
            }
        });

        let job = job_for(&fx, target_id).await;
        let outcome = executor.execute(&job, &cancel).await.unwrap();
        assert_eq!(outcome, HarvestOutcome::Partial);

        // exactly one page was merged and stays merged
        let target = fx.targets.get(target_id).await.unwrap().unwrap();
        assert_eq!(target.merged_total, 20);
        let state = fx.resume.load(target_id).await.unwrap();
        assert_eq!(state.current_page_offset, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn merged_total_is_monotonic_across_invocations() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 40).await;
        fx.upstream
            .stub_pages(BASE_QUERY, vec![records("a", 0..20), records("a", 5..25)]);

        let job = job_for(&fx, target_id).await;
        let mut previous = 0i64;
        for _ in 0..3 {
            let _ = fx.executor().execute(&job, &CancelFlag::new()).await.unwrap();
            let merged = fx.targets.get(target_id).await.unwrap().unwrap().merged_total;
            assert!(merged >= previous);
            previous = merged;
        }
        // overlapping pages dedup to 25 distinct records
        assert_eq!(previous, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn declared_total_refreshes_from_unpartitioned_probe() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 10).await;
        fx.upstream.stub_pages(BASE_QUERY, vec![records("a", 0..10)]);
        fx.upstream.stub_declared_total(BASE_QUERY, 37);

        let job = job_for(&fx, target_id).await;
        fx.executor().execute(&job, &CancelFlag::new()).await.unwrap();

        let target = fx.targets.get(target_id).await.unwrap().unwrap();
        assert_eq!(target.declared_total, 37);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_target_is_skipped() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 10).await;
        fx.upstream.stub_pages(BASE_QUERY, vec![records("a", 0..10)]);
        fx.targets.set_paused(target_id, true).await.unwrap();

        let job = job_for(&fx, target_id).await;
        let outcome = fx.executor().execute(&job, &CancelFlag::new()).await.unwrap();
        assert_eq!(outcome, HarvestOutcome::Completed);
        assert!(fx.upstream.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_target_fails_job() {
        let fx = EngineFixtures::new();
        let ghost = Uuid::new_v4();
        let id = fx
            .jobs
            .enqueue(NewHarvestJob::for_group("ghost", vec![ghost]))
            .await
            .unwrap();
        fx.jobs.claim_next_excluding(&[]).await.unwrap();
        let job = fx.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);

        let result = fx.executor().execute(&job, &CancelFlag::new()).await;
        assert!(matches!(result, Err(Error::TargetNotFound(t)) if t == ghost));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_updates_are_persisted_on_the_job() {
        let fx = EngineFixtures::new();
        let target_id = fresh_target(&fx, 20).await;
        fx.upstream.stub_pages(BASE_QUERY, vec![records("a", 0..20)]);

        let job = job_for(&fx, target_id).await;
        fx.executor().execute(&job, &CancelFlag::new()).await.unwrap();

        let stored = fx.jobs.get(job.id).await.unwrap().unwrap();
        let progress = stored.progress.expect("progress should be recorded");
        assert_eq!(progress.merged_total, 20);
        assert_eq!(progress.current_partition, Some("all".to_string()));
        assert_eq!(progress.current_page, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn record_helper_builds_distinct_ids() {
        // guard against fixture regressions silently weakening the suite
        let a = record("x-1");
        let b = record("x-2");
        assert_ne!(a.external_id, b.external_id);
        let _: &MemoryJobRepository = &EngineFixtures::new().jobs;
    }
}
