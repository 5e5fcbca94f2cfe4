//! # folio-core
//!
//! Core types, traits, and abstractions for the folio citation harvesting
//! engine.
//!
//! This crate provides the foundational data structures and trait definitions
//! that the other folio crates depend on: harvest targets, resume state,
//! partition descriptors, the query audit log, harvest jobs, and the
//! repository/upstream seams the engine is wired through.

pub mod config;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{GapConfig, HarvestConfig};
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
