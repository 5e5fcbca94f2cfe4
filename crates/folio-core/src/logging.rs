//! Structured logging schema and field name constants for folio.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation tools can query by standardized names across every
//! subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Decision points, partition transitions, config choices |
//! | TRACE | Per-page iteration, high-volume data |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "harvest", "scheduler", "gap"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "executor", "planner", "pool", "query_log"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "execute", "merge_page", "claim_next", "scan"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Harvest target UUID being operated on.
pub const TARGET_ID: &str = "target_id";

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Partition storage key ("year:2015", "letter:m", ...).
pub const PARTITION: &str = "partition";

/// Page number within a partition.
pub const PAGE: &str = "page";

/// Literal upstream query string.
pub const QUERY: &str = "query";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of records a page returned.
pub const RESULT_COUNT: &str = "result_count";

/// Number of genuinely new records a merge accepted.
pub const NEW_COUNT: &str = "new_count";

/// Shortfall between declared and merged totals.
pub const GAP: &str = "gap";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
