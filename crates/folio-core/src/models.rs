//! Data model for the folio harvesting engine.
//!
//! The unit of harvesting is a [`HarvestTarget`] (one edition of a work).
//! Each target owns exactly one [`ResumeState`] describing which partitions
//! of its citation search are done and where paging stopped. Every upstream
//! call leaves an immutable [`QueryLogEntry`], and scheduled work is carried
//! by [`HarvestJob`]s.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// PARTITIONING
// =============================================================================

/// How a harvest target's search is split to stay under the upstream
/// per-query result cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    /// Single unpartitioned query (target fits under the cap).
    #[default]
    None,
    /// One partition per publication year of the citing work.
    ByYear,
    /// One partition per first letter of the citing author's surname.
    ByLetter,
    /// One partition per citation language.
    ByLanguage,
}

impl PartitionScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ByYear => "by_year",
            Self::ByLetter => "by_letter",
            Self::ByLanguage => "by_language",
        }
    }

    /// Parse scheme from its storage string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "by_year" => Some(Self::ByYear),
            "by_letter" => Some(Self::ByLetter),
            "by_language" => Some(Self::ByLanguage),
            _ => None,
        }
    }
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single bounded sub-query of a harvest target.
///
/// Keys are tagged variants rather than bare strings so a year key can never
/// collide with a letter or language key; the scheme travels with the value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scheme", content = "value", rename_all = "snake_case")]
pub enum PartitionKey {
    /// Sentinel key for unpartitioned harvests.
    All,
    Year(i32),
    Letter(char),
    Language(String),
}

impl PartitionKey {
    pub fn scheme(&self) -> PartitionScheme {
        match self {
            Self::All => PartitionScheme::None,
            Self::Year(_) => PartitionScheme::ByYear,
            Self::Letter(_) => PartitionScheme::ByLetter,
            Self::Language(_) => PartitionScheme::ByLanguage,
        }
    }

    /// Canonical scheme-prefixed string stored in `completed_partitions`.
    pub fn storage_key(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Year(y) => format!("year:{y}"),
            Self::Letter(c) => format!("letter:{c}"),
            Self::Language(l) => format!("lang:{l}"),
        }
    }

    /// Inverse of [`storage_key`](Self::storage_key).
    pub fn parse(s: &str) -> Option<Self> {
        if s == "all" {
            return Some(Self::All);
        }
        let (prefix, value) = s.split_once(':')?;
        match prefix {
            "year" => value.parse().ok().map(Self::Year),
            "letter" => {
                let mut chars = value.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(Self::Letter(c)),
                    _ => None,
                }
            }
            "lang" if !value.is_empty() => Some(Self::Language(value.to_string())),
            _ => None,
        }
    }

    /// The partition value recorded in the query audit log (`None` for the
    /// unpartitioned sentinel).
    pub fn value(&self) -> Option<String> {
        match self {
            Self::All => None,
            Self::Year(y) => Some(y.to_string()),
            Self::Letter(c) => Some(c.to_string()),
            Self::Language(l) => Some(l.clone()),
        }
    }

    /// Render the literal sub-query issued upstream for this partition.
    pub fn apply(&self, base_query: &str) -> String {
        match self {
            Self::All => base_query.to_string(),
            Self::Year(y) => format!("{base_query} year:{y}"),
            Self::Letter(c) => format!("{base_query} author:{c}*"),
            Self::Language(l) => format!("{base_query} lang:{l}"),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

// =============================================================================
// RESUME STATE
// =============================================================================

/// Persisted per-target cursor describing exactly which partitions and pages
/// of a harvest are done.
///
/// Mutated incrementally after every successful page, never only at job end,
/// so a crash loses at most one page of progress. Invariant: a key present in
/// `completed_partitions` is never re-queried, and `current_page_offset` is
/// reset to 0 the moment its partition completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub scheme: PartitionScheme,
    pub completed_partitions: BTreeSet<String>,
    pub current_partition: Option<PartitionKey>,
    pub current_page_offset: i64,
}

impl ResumeState {
    pub fn is_completed(&self, key: &PartitionKey) -> bool {
        self.completed_partitions.contains(&key.storage_key())
    }

    /// Page offset to start from when entering `key`: the persisted offset
    /// for the in-flight partition, 0 for everything else.
    pub fn start_offset(&self, key: &PartitionKey) -> i64 {
        if self.current_partition.as_ref() == Some(key) {
            self.current_page_offset
        } else {
            0
        }
    }

    /// Record that all pages of `key` before `next_page` are durably merged.
    pub fn record_page(&mut self, key: &PartitionKey, next_page: i64) {
        self.current_partition = Some(key.clone());
        self.current_page_offset = next_page;
    }

    /// Move `key` into the completed set and reset the page cursor.
    pub fn complete_partition(&mut self, key: &PartitionKey) {
        self.completed_partitions.insert(key.storage_key());
        if self.current_partition.as_ref() == Some(key) {
            self.current_partition = None;
            self.current_page_offset = 0;
        }
    }
}

// =============================================================================
// HARVEST TARGET
// =============================================================================

/// The unit of harvesting: one edition of a work whose citations are
/// being collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestTarget {
    pub id: Uuid,
    /// Identifier of the upstream entity this target maps to. Sibling
    /// targets (other editions backed by the same upstream record) share it.
    pub source_key: String,
    /// Base upstream query string for this target.
    pub query: String,
    /// Upstream's reported result count. May be stale or drift between calls.
    pub declared_total: i64,
    /// Count of distinct citation records actually merged. Monotonic except
    /// on explicit full re-harvest.
    pub merged_total: i64,
    /// Partitioning scheme forced by the caller. Set when year partitions
    /// are known to be over-cap for this target (nested partitioning by
    /// author letter or language); `None` lets the planner derive one.
    pub scheme_override: Option<PartitionScheme>,
    /// Excludes the target from auto-resume continuation.
    pub harvest_paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HarvestTarget {
    /// Shortfall between what upstream declares and what has been merged.
    pub fn gap(&self) -> i64 {
        (self.declared_total - self.merged_total).max(0)
    }
}

/// Request for registering a new harvest target.
#[derive(Debug, Clone)]
pub struct NewHarvestTarget {
    pub source_key: String,
    pub query: String,
    pub declared_total: i64,
}

// =============================================================================
// CITATION RECORDS
// =============================================================================

/// A single citation record returned by the upstream source.
///
/// `external_id` is the stable upstream identifier and the dedup key for
/// idempotent merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationRecord {
    pub external_id: String,
    pub title: String,
    pub authors: Option<String>,
    pub year: Option<i32>,
    pub language: Option<String>,
    pub url: Option<String>,
    pub snippet: Option<String>,
}

// =============================================================================
// QUERY AUDIT LOG
// =============================================================================

/// Immutable audit record of one upstream call. Created once per attempt,
/// never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub id: Uuid,
    pub target_id: Uuid,
    pub job_id: Option<Uuid>,
    /// The literal query string issued upstream.
    pub query: String,
    pub partition_type: PartitionScheme,
    pub partition_value: Option<String>,
    pub page_number: i64,
    pub results_count: i64,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for appending a new audit entry.
#[derive(Debug, Clone)]
pub struct NewQueryLogEntry {
    pub target_id: Uuid,
    pub job_id: Option<Uuid>,
    pub query: String,
    pub partition_type: PartitionScheme,
    pub partition_value: Option<String>,
    pub page_number: i64,
    pub results_count: i64,
    pub success: bool,
    pub error_message: Option<String>,
}

// =============================================================================
// JOBS
// =============================================================================

/// Lifecycle state of a harvest job. Terminal states are final: a
/// continuation is always a new job, never a resurrection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one harvest job invocation.
///
/// `Partial` means upstream trouble stopped paging early; everything already
/// merged and every persisted offset is kept, and the gap detector will
/// enqueue a continuation later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarvestOutcome {
    Completed,
    Partial,
    Failed,
}

impl HarvestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for HarvestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live progress snapshot exposed on a running job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub merged_total: i64,
    pub declared_total: i64,
    pub current_partition: Option<String>,
    pub current_page: i64,
}

/// A unit of scheduled harvest work.
///
/// A job carries one target id, or several when sibling targets share the
/// same upstream entity and a single pass over the upstream results serves
/// them all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestJob {
    pub id: Uuid,
    pub target_ids: Vec<Uuid>,
    /// Shared upstream entity key, used to deduplicate continuation jobs.
    pub source_key: String,
    pub priority: i32,
    pub status: JobStatus,
    pub outcome: Option<HarvestOutcome>,
    pub error_message: Option<String>,
    pub progress: Option<JobProgress>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Request for enqueueing a new harvest job.
#[derive(Debug, Clone)]
pub struct NewHarvestJob {
    pub target_ids: Vec<Uuid>,
    pub source_key: String,
    pub priority: i32,
}

impl NewHarvestJob {
    /// Job for a single target.
    pub fn for_target(target: &HarvestTarget) -> Self {
        Self {
            target_ids: vec![target.id],
            source_key: target.source_key.clone(),
            priority: 0,
        }
    }

    /// Job covering a group of sibling targets sharing one upstream entity.
    pub fn for_group(source_key: impl Into<String>, target_ids: Vec<Uuid>) -> Self {
        Self {
            target_ids,
            source_key: source_key.into(),
            priority: 0,
        }
    }
}

/// Queue statistics summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed_last_hour: i64,
    pub failed_last_hour: i64,
    pub total: i64,
}
