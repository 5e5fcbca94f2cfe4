//! # folio-harvest
//!
//! Partitioned, resumable harvesting engine for folio.
//!
//! This crate provides:
//! - A resume-aware partition planner that splits oversized harvests into
//!   bounded sub-queries (by year, author letter, or language)
//! - A harvest executor that pages through upstream results, merging
//!   idempotently and checkpointing after every page
//! - A gap detector that re-enqueues continuation work for targets whose
//!   merged totals fall short of what upstream declares
//! - A bounded-concurrency job scheduler with per-target mutual exclusion,
//!   staggered starts, and cooperative cancellation
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use folio_db::Database;
//! use folio_harvest::{HarvestScheduler, SchedulerConfig};
//! use folio_core::{GapConfig, HarvestConfig};
//!
//! let db = Database::connect("postgres://...").await?;
//! let upstream = Arc::new(MyScraperClient::new());
//!
//! let scheduler = HarvestScheduler::for_database(
//!     &db,
//!     upstream,
//!     HarvestConfig::from_env(),
//!     GapConfig::from_env(),
//!     SchedulerConfig::from_env(),
//! );
//! let handle = scheduler.start();
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod executor;
pub mod fixtures;
pub mod gap;
pub mod planner;
pub mod scheduler;

// Re-export core types
pub use folio_core::*;

pub use executor::{backoff_duration, CancelFlag, HarvestExecutor};
pub use gap::GapDetector;
pub use planner::{plan, PartitionPlan};
pub use scheduler::{HarvestScheduler, SchedulerConfig, SchedulerEvent, SchedulerHandle};

/// Default concurrency permit pool size.
pub const DEFAULT_MAX_CONCURRENT: usize = folio_core::defaults::MAX_CONCURRENT_HARVESTS;

/// Default polling interval when the queue is empty (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = folio_core::defaults::SCHEDULER_POLL_INTERVAL_MS;
