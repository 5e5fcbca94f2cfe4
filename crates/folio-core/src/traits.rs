//! Core traits for the folio harvesting engine.
//!
//! These traits are the engine's only view of persistence and of the
//! upstream source. The engine assumes each call is individually durable and
//! atomic; it implements its own invariants (merge-then-advance ordering,
//! monotonic counters, completed-partition exclusion) on top.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// TARGET REPOSITORY
// =============================================================================

/// Repository for harvest target CRUD and counters.
#[async_trait]
pub trait TargetRepository: Send + Sync {
    /// Register a new harvest target.
    async fn create(&self, req: NewHarvestTarget) -> Result<Uuid>;

    /// Fetch a target by ID.
    async fn get(&self, id: Uuid) -> Result<Option<HarvestTarget>>;

    /// List all targets.
    async fn list(&self) -> Result<Vec<HarvestTarget>>;

    /// List unpaused targets whose absolute gap exceeds `min_gap`.
    ///
    /// The relative-floor filter is applied by the gap detector; this is the
    /// coarse pre-selection.
    async fn list_incomplete(&self, min_gap: i64) -> Result<Vec<HarvestTarget>>;

    /// Add a merge delta to `merged_total`. The counter only moves forward.
    async fn add_merged(&self, id: Uuid, delta: u64) -> Result<()>;

    /// Record the most recently observed upstream result count.
    async fn set_declared_total(&self, id: Uuid, declared_total: i64) -> Result<()>;

    /// Force a partitioning scheme for a target (nested partitioning when
    /// its year partitions are over-cap), or clear the override.
    async fn set_scheme_override(&self, id: Uuid, scheme: Option<PartitionScheme>) -> Result<()>;

    /// Pause or unpause a target (paused targets are skipped by auto-resume).
    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<()>;

    /// Explicit full re-harvest: zero the merged counter and drop all
    /// harvest state so the next job starts from scratch.
    async fn reset_harvest(&self, id: Uuid) -> Result<()>;
}

// =============================================================================
// CITATION MERGE STORE
// =============================================================================

/// Idempotent upsert store for citation records.
#[async_trait]
pub trait CitationStore: Send + Sync {
    /// Merge one page of records, deduplicating on `external_id`.
    ///
    /// Returns the count of **genuinely new** records accepted, not the count
    /// processed. Every downstream accounting signal (merged totals, stale
    /// page detection, gap scans) depends on this delta being exact.
    async fn merge_page(&self, target_id: Uuid, records: &[CitationRecord]) -> Result<u64>;

    /// Count of distinct records stored for a target.
    async fn count_for_target(&self, target_id: Uuid) -> Result<i64>;
}

// =============================================================================
// RESUME STATE
// =============================================================================

/// Persistence for per-target resume cursors.
///
/// `save` is called after every page, so implementations must keep it cheap;
/// write coalescing is fine as long as the latest state is durable before
/// the owning job is reported complete. Implementations must never derive
/// state by re-counting merged records.
#[async_trait]
pub trait ResumeStateRepository: Send + Sync {
    /// Load the cursor for a target, or the default fresh state if none
    /// is stored.
    async fn load(&self, target_id: Uuid) -> Result<ResumeState>;

    /// Persist the cursor for a target.
    async fn save(&self, target_id: Uuid, state: &ResumeState) -> Result<()>;
}

// =============================================================================
// QUERY AUDIT LOG
// =============================================================================

/// Append-only audit log of upstream sub-queries.
#[async_trait]
pub trait QueryLogRepository: Send + Sync {
    /// Append one entry. Entries are immutable once written.
    async fn append(&self, entry: NewQueryLogEntry) -> Result<Uuid>;

    /// Most recent entries for a target, newest first.
    async fn list_for_target(&self, target_id: Uuid, limit: i64) -> Result<Vec<QueryLogEntry>>;
}

// =============================================================================
// JOB REPOSITORY
// =============================================================================

/// Repository for harvest job queue operations.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Queue a new job.
    async fn enqueue(&self, req: NewHarvestJob) -> Result<Uuid>;

    /// Queue a job unless a pending or running job already exists for the
    /// same `source_key`. Returns `None` when skipped.
    async fn enqueue_deduplicated(&self, req: NewHarvestJob) -> Result<Option<Uuid>>;

    /// Atomically claim the next pending job touching none of the excluded
    /// target ids, moving it to `running`.
    ///
    /// The exclusion list is how per-target mutual exclusion is enforced: a
    /// job for an in-flight target stays pending and is picked up after the
    /// running job releases it.
    async fn claim_next_excluding(&self, exclude_targets: &[Uuid]) -> Result<Option<HarvestJob>>;

    /// Update the live progress snapshot of a running job.
    async fn update_progress(&self, job_id: Uuid, progress: &JobProgress) -> Result<()>;

    /// Mark a running job completed with the given outcome.
    async fn complete(&self, job_id: Uuid, outcome: HarvestOutcome) -> Result<()>;

    /// Mark a running job failed with a terse reason.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Cancel a pending job. Returns false if the job was not pending
    /// (running jobs are cancelled cooperatively via their cancel flag).
    async fn cancel(&self, job_id: Uuid) -> Result<bool>;

    /// Mark a running job cancelled after it observed its cancel flag and
    /// stopped at a checkpoint.
    async fn mark_cancelled(&self, job_id: Uuid) -> Result<()>;

    /// Get a job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<HarvestJob>>;

    /// Count of pending jobs.
    async fn pending_count(&self) -> Result<i64>;

    /// List recent jobs, newest first.
    async fn list_recent(&self, limit: i64) -> Result<Vec<HarvestJob>>;

    /// Queue statistics.
    async fn queue_stats(&self) -> Result<QueueStats>;
}

// =============================================================================
// UPSTREAM SEARCH
// =============================================================================

/// One page of upstream search results.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub records: Vec<CitationRecord>,
    /// Upstream's reported total for the query. Known to drift between
    /// calls; consumers must treat it as advisory.
    pub declared_total: i64,
}

/// The abstract paged search capability the engine harvests from.
///
/// Transport concerns (HTTP, proxies, HTML parsing) live behind this trait.
/// Implementations surface failures through the error taxonomy:
/// [`Error::UpstreamTransient`](crate::Error::UpstreamTransient) for
/// timeouts/rate limits and
/// [`Error::UpstreamPermanent`](crate::Error::UpstreamPermanent) for
/// rejected queries.
#[async_trait]
pub trait UpstreamSearch: Send + Sync {
    /// Fetch one page of results for a literal query string.
    async fn search(&self, query: &str, page: i64) -> Result<SearchPage>;
}
