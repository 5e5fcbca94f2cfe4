//! In-memory repository fixtures.
//!
//! Always compiled (not `#[cfg(test)]`) so integration tests in `tests/`
//! and downstream consumers can exercise the engine without a Postgres
//! instance. Behavior mirrors the `folio-db` implementations: idempotent
//! merges keyed on external id, claim-time target exclusion, source-key
//! deduplication.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use folio_core::{
    CitationRecord, CitationStore, Error, GapConfig, HarvestConfig, HarvestJob, HarvestOutcome,
    HarvestTarget, JobProgress, JobRepository, JobStatus, NewHarvestJob, NewHarvestTarget,
    NewQueryLogEntry, QueryLogEntry, QueryLogRepository, QueueStats, Result, ResumeState,
    ResumeStateRepository, SearchPage, TargetRepository, UpstreamSearch,
};

use crate::executor::HarvestExecutor;
use crate::gap::GapDetector;

/// Build a minimal citation record with the given external id.
pub fn record(external_id: &str) -> CitationRecord {
    CitationRecord {
        external_id: external_id.to_string(),
        title: format!("Citing work {external_id}"),
        authors: Some("Doe, J.".to_string()),
        year: Some(2015),
        language: Some("en".to_string()),
        url: None,
        snippet: None,
    }
}

/// Build a page of records with ids `{prefix}-{i}` for `i` in `range`.
pub fn records(prefix: &str, range: Range<u32>) -> Vec<CitationRecord> {
    range.map(|i| record(&format!("{prefix}-{i}"))).collect()
}

// =============================================================================
// TARGETS
// =============================================================================

/// In-memory [`TargetRepository`].
#[derive(Default)]
pub struct MemoryTargetRepository {
    targets: Mutex<HashMap<Uuid, HarvestTarget>>,
}

impl MemoryTargetRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TargetRepository for MemoryTargetRepository {
    async fn create(&self, req: NewHarvestTarget) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        self.targets.lock().unwrap().insert(
            id,
            HarvestTarget {
                id,
                source_key: req.source_key,
                query: req.query,
                declared_total: req.declared_total,
                merged_total: 0,
                scheme_override: None,
                harvest_paused: false,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<HarvestTarget>> {
        Ok(self.targets.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<HarvestTarget>> {
        let mut all: Vec<_> = self.targets.lock().unwrap().values().cloned().collect();
        all.sort_by_key(|t| t.created_at);
        Ok(all)
    }

    async fn list_incomplete(&self, min_gap: i64) -> Result<Vec<HarvestTarget>> {
        let mut selected: Vec<_> = self
            .targets
            .lock()
            .unwrap()
            .values()
            .filter(|t| !t.harvest_paused && t.declared_total - t.merged_total > min_gap)
            .cloned()
            .collect();
        selected.sort_by_key(|t| std::cmp::Reverse(t.gap()));
        Ok(selected)
    }

    async fn add_merged(&self, id: Uuid, delta: u64) -> Result<()> {
        let mut targets = self.targets.lock().unwrap();
        let target = targets.get_mut(&id).ok_or(Error::TargetNotFound(id))?;
        target.merged_total += delta as i64;
        target.updated_at = Utc::now();
        Ok(())
    }

    async fn set_declared_total(&self, id: Uuid, declared_total: i64) -> Result<()> {
        let mut targets = self.targets.lock().unwrap();
        let target = targets.get_mut(&id).ok_or(Error::TargetNotFound(id))?;
        target.declared_total = declared_total;
        target.updated_at = Utc::now();
        Ok(())
    }

    async fn set_scheme_override(
        &self,
        id: Uuid,
        scheme: Option<folio_core::PartitionScheme>,
    ) -> Result<()> {
        let mut targets = self.targets.lock().unwrap();
        let target = targets.get_mut(&id).ok_or(Error::TargetNotFound(id))?;
        target.scheme_override = scheme;
        target.updated_at = Utc::now();
        Ok(())
    }

    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<()> {
        let mut targets = self.targets.lock().unwrap();
        let target = targets.get_mut(&id).ok_or(Error::TargetNotFound(id))?;
        target.harvest_paused = paused;
        target.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_harvest(&self, id: Uuid) -> Result<()> {
        let mut targets = self.targets.lock().unwrap();
        let target = targets.get_mut(&id).ok_or(Error::TargetNotFound(id))?;
        target.merged_total = 0;
        target.updated_at = Utc::now();
        Ok(())
    }
}

// =============================================================================
// CITATIONS
// =============================================================================

/// In-memory [`CitationStore`] deduplicating on external id.
#[derive(Default)]
pub struct MemoryCitationStore {
    seen: Mutex<HashMap<Uuid, BTreeSet<String>>>,
}

impl MemoryCitationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CitationStore for MemoryCitationStore {
    async fn merge_page(&self, target_id: Uuid, page: &[CitationRecord]) -> Result<u64> {
        let mut seen = self.seen.lock().unwrap();
        let ids = seen.entry(target_id).or_default();
        let mut newly_added = 0u64;
        for citation in page {
            if ids.insert(citation.external_id.clone()) {
                newly_added += 1;
            }
        }
        Ok(newly_added)
    }

    async fn count_for_target(&self, target_id: Uuid) -> Result<i64> {
        Ok(self
            .seen
            .lock()
            .unwrap()
            .get(&target_id)
            .map_or(0, |ids| ids.len() as i64))
    }
}

// =============================================================================
// RESUME STATE
// =============================================================================

/// In-memory [`ResumeStateRepository`] with save-failure injection.
#[derive(Default)]
pub struct MemoryResumeStateRepository {
    states: Mutex<HashMap<Uuid, ResumeState>>,
    fail_saves: AtomicBool,
}

impl MemoryResumeStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail with a database error.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResumeStateRepository for MemoryResumeStateRepository {
    async fn load(&self, target_id: Uuid) -> Result<ResumeState> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(&target_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, target_id: Uuid, state: &ResumeState) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolClosed));
        }
        self.states.lock().unwrap().insert(target_id, state.clone());
        Ok(())
    }
}

// =============================================================================
// QUERY LOG
// =============================================================================

/// In-memory [`QueryLogRepository`].
#[derive(Default)]
pub struct MemoryQueryLogRepository {
    entries: Mutex<Vec<QueryLogEntry>>,
}

impl MemoryQueryLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in append order.
    pub fn entries(&self) -> Vec<QueryLogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryLogRepository for MemoryQueryLogRepository {
    async fn append(&self, entry: NewQueryLogEntry) -> Result<Uuid> {
        let id = Uuid::now_v7();
        self.entries.lock().unwrap().push(QueryLogEntry {
            id,
            target_id: entry.target_id,
            job_id: entry.job_id,
            query: entry.query,
            partition_type: entry.partition_type,
            partition_value: entry.partition_value,
            page_number: entry.page_number,
            results_count: entry.results_count,
            success: entry.success,
            error_message: entry.error_message,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn list_for_target(&self, target_id: Uuid, limit: i64) -> Result<Vec<QueryLogEntry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .rev()
            .filter(|e| e.target_id == target_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// In-memory [`JobRepository`].
#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: Mutex<Vec<HarvestJob>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// All jobs in enqueue order.
    pub fn all(&self) -> Vec<HarvestJob> {
        self.jobs.lock().unwrap().clone()
    }

    fn push(&self, req: NewHarvestJob) -> Uuid {
        let id = Uuid::now_v7();
        self.jobs.lock().unwrap().push(HarvestJob {
            id,
            target_ids: req.target_ids,
            source_key: req.source_key,
            priority: req.priority,
            status: JobStatus::Pending,
            outcome: None,
            error_message: None,
            progress: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        });
        id
    }

    fn update<F: FnOnce(&mut HarvestJob)>(&self, job_id: Uuid, mutate: F) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.iter_mut().find(|j| j.id == job_id) {
            Some(job) => {
                mutate(job);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn enqueue(&self, req: NewHarvestJob) -> Result<Uuid> {
        if req.target_ids.is_empty() {
            return Err(Error::InvalidInput("job has no targets".to_string()));
        }
        Ok(self.push(req))
    }

    async fn enqueue_deduplicated(&self, req: NewHarvestJob) -> Result<Option<Uuid>> {
        if req.target_ids.is_empty() {
            return Err(Error::InvalidInput("job has no targets".to_string()));
        }
        {
            let jobs = self.jobs.lock().unwrap();
            let duplicate = jobs.iter().any(|j| {
                j.source_key == req.source_key
                    && matches!(j.status, JobStatus::Pending | JobStatus::Running)
            });
            if duplicate {
                return Ok(None);
            }
        }
        Ok(Some(self.push(req)))
    }

    async fn claim_next_excluding(&self, exclude_targets: &[Uuid]) -> Result<Option<HarvestJob>> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut best: Option<usize> = None;
        for (idx, job) in jobs.iter().enumerate() {
            if job.status != JobStatus::Pending {
                continue;
            }
            if job.target_ids.iter().any(|t| exclude_targets.contains(t)) {
                continue;
            }
            match best {
                Some(b)
                    if (jobs[b].priority, std::cmp::Reverse(jobs[b].created_at))
                        >= (job.priority, std::cmp::Reverse(job.created_at)) => {}
                _ => best = Some(idx),
            }
        }
        Ok(best.map(|idx| {
            let job = &mut jobs[idx];
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.clone()
        }))
    }

    async fn update_progress(&self, job_id: Uuid, progress: &JobProgress) -> Result<()> {
        self.update(job_id, |job| {
            if job.status == JobStatus::Running {
                job.progress = Some(progress.clone());
            }
        });
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, outcome: HarvestOutcome) -> Result<()> {
        self.update(job_id, |job| {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Completed;
                job.outcome = Some(outcome);
                job.completed_at = Some(Utc::now());
            }
        });
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        self.update(job_id, |job| {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Failed;
                job.outcome = Some(HarvestOutcome::Failed);
                job.error_message = Some(error.to_string());
                job.completed_at = Some(Utc::now());
            }
        });
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let mut cancelled = false;
        self.update(job_id, |job| {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                cancelled = true;
            }
        });
        Ok(cancelled)
    }

    async fn mark_cancelled(&self, job_id: Uuid) -> Result<()> {
        self.update(job_id, |job| {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
            }
        });
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<HarvestJob>> {
        Ok(self.jobs.lock().unwrap().iter().find(|j| j.id == job_id).cloned())
    }

    async fn pending_count(&self) -> Result<i64> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .count() as i64)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<HarvestJob>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.iter().rev().take(limit as usize).cloned().collect())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let jobs = self.jobs.lock().unwrap();
        let hour_ago = Utc::now() - ChronoDuration::hours(1);
        let recent = |j: &&HarvestJob| j.completed_at.is_some_and(|t| t > hour_ago);
        Ok(QueueStats {
            pending: jobs.iter().filter(|j| j.status == JobStatus::Pending).count() as i64,
            running: jobs.iter().filter(|j| j.status == JobStatus::Running).count() as i64,
            completed_last_hour: jobs
                .iter()
                .filter(|j| j.status == JobStatus::Completed)
                .filter(recent)
                .count() as i64,
            failed_last_hour: jobs
                .iter()
                .filter(|j| j.status == JobStatus::Failed)
                .filter(recent)
                .count() as i64,
            total: jobs.len() as i64,
        })
    }
}

// =============================================================================
// UPSTREAM
// =============================================================================

/// Kind of injected upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Scriptable [`UpstreamSearch`] fake: stub pages per query, inject
/// failures per (query, page), and inspect the calls the engine issued.
#[derive(Default)]
pub struct ScriptedUpstream {
    pages: Mutex<HashMap<String, Vec<Vec<CitationRecord>>>>,
    declared: Mutex<HashMap<String, i64>>,
    failures: Mutex<HashMap<(String, i64), VecDeque<FailureKind>>>,
    calls: Mutex<Vec<(String, i64)>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stub the result pages for a literal query string. Pages past the end
    /// of the vector come back empty.
    pub fn stub_pages(&self, query: &str, pages: Vec<Vec<CitationRecord>>) {
        self.pages.lock().unwrap().insert(query.to_string(), pages);
    }

    /// Stub the declared total reported alongside every page of a query.
    pub fn stub_declared_total(&self, query: &str, total: i64) {
        self.declared.lock().unwrap().insert(query.to_string(), total);
    }

    /// Inject one failure for the next call to (query, page). Repeated
    /// pushes queue up and are consumed one per call.
    pub fn push_failure(&self, query: &str, page: i64, kind: FailureKind) {
        self.failures
            .lock()
            .unwrap()
            .entry((query.to_string(), page))
            .or_default()
            .push_back(kind);
    }

    /// Every (query, page) call issued so far.
    pub fn calls(&self) -> Vec<(String, i64)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl UpstreamSearch for ScriptedUpstream {
    async fn search(&self, query: &str, page: i64) -> Result<SearchPage> {
        self.calls.lock().unwrap().push((query.to_string(), page));

        if let Some(queue) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&(query.to_string(), page))
        {
            if let Some(kind) = queue.pop_front() {
                return Err(match kind {
                    FailureKind::Transient => {
                        Error::UpstreamTransient("injected timeout".to_string())
                    }
                    FailureKind::Permanent => {
                        Error::UpstreamPermanent("injected query rejection".to_string())
                    }
                });
            }
        }

        let records = self
            .pages
            .lock()
            .unwrap()
            .get(query)
            .and_then(|pages| usize::try_from(page).ok().and_then(|i| pages.get(i)))
            .cloned()
            .unwrap_or_default();
        let declared_total = self.declared.lock().unwrap().get(query).copied().unwrap_or(0);

        Ok(SearchPage {
            records,
            declared_total,
        })
    }
}

// =============================================================================
// BUNDLE
// =============================================================================

/// Everything an engine test needs, pre-wired.
pub struct EngineFixtures {
    pub targets: Arc<MemoryTargetRepository>,
    pub citations: Arc<MemoryCitationStore>,
    pub resume: Arc<MemoryResumeStateRepository>,
    pub query_log: Arc<MemoryQueryLogRepository>,
    pub jobs: Arc<MemoryJobRepository>,
    pub upstream: Arc<ScriptedUpstream>,
    pub config: HarvestConfig,
}

impl EngineFixtures {
    pub fn new() -> Self {
        Self {
            targets: Arc::new(MemoryTargetRepository::new()),
            citations: Arc::new(MemoryCitationStore::new()),
            resume: Arc::new(MemoryResumeStateRepository::new()),
            query_log: Arc::new(MemoryQueryLogRepository::new()),
            jobs: Arc::new(MemoryJobRepository::new()),
            upstream: Arc::new(ScriptedUpstream::new()),
            config: HarvestConfig::default(),
        }
    }

    /// Executor over these fixtures with the bundle's config.
    pub fn executor(&self) -> HarvestExecutor {
        self.executor_with_config(self.config.clone())
    }

    /// Executor over these fixtures with an explicit config.
    pub fn executor_with_config(&self, config: HarvestConfig) -> HarvestExecutor {
        HarvestExecutor::new(
            self.targets.clone(),
            self.citations.clone(),
            self.resume.clone(),
            self.query_log.clone(),
            self.jobs.clone(),
            self.upstream.clone(),
            config,
        )
    }

    /// Gap detector over these fixtures.
    pub fn gap_detector(&self, config: GapConfig) -> GapDetector {
        GapDetector::new(self.targets.clone(), self.jobs.clone(), config)
    }
}

impl Default for EngineFixtures {
    fn default() -> Self {
        Self::new()
    }
}
