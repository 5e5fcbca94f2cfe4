//! Centralized default constants for the folio harvesting engine.
//!
//! **This module is the single source of truth** for all shared default
//! values. All crates reference these constants instead of defining their
//! own magic numbers. Every value here is a policy knob surfaced through
//! [`config`](crate::config); none is hard-coded behavior.

// =============================================================================
// PARTITIONING
// =============================================================================

/// Upstream single-query result cap. Targets declaring more results than
/// this are split into partitions.
pub const UPSTREAM_RESULT_CAP: i64 = 1000;

/// Earliest calendar year enumerated by the by-year scheme.
pub const PARTITION_YEAR_FLOOR: i32 = 1990;

/// Consecutive empty years (scanned descending) before the remaining tail
/// of years is treated as exhausted. Bounds cost on sparse targets.
pub const MAX_CONSECUTIVE_EMPTY_YEARS: u32 = 3;

/// Consecutive pages yielding zero *new* records before a partition is
/// considered drained. Distinct from zero results: pages near a partition
/// boundary can return only already-merged records.
pub const MAX_CONSECUTIVE_STALE_PAGES: u32 = 2;

// =============================================================================
// UPSTREAM RETRIES
// =============================================================================

/// Retry budget for a single page fetch on transient upstream errors.
pub const PAGE_MAX_RETRIES: u32 = 3;

// =============================================================================
// GAP DETECTION
// =============================================================================

/// Absolute shortfall a target must exceed before auto-resume selects it.
pub const GAP_ABSOLUTE_FLOOR: i64 = 100;

/// Relative shortfall (fraction of declared_total) a target must exceed
/// before auto-resume selects it. Both floors guard against upstream count
/// drift producing false positives.
pub const GAP_RELATIVE_FLOOR: f64 = 0.10;

/// Interval between gap-detector scans while the scheduler is idle.
pub const GAP_SCAN_INTERVAL_SECS: u64 = 300;

// =============================================================================
// SCHEDULING
// =============================================================================

/// Concurrency permit pool size for harvest jobs.
pub const MAX_CONCURRENT_HARVESTS: usize = 5;

/// Scheduler poll interval when the queue is empty, in milliseconds.
pub const SCHEDULER_POLL_INTERVAL_MS: u64 = 2_000;

/// Stagger between job starts within one claim batch, in milliseconds.
/// Keeps a batch of fresh jobs from firing their first page queries at the
/// upstream source simultaneously.
pub const START_STAGGER_MS: u64 = 750;

/// Scheduler event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;
