//! Partition planning.
//!
//! The planner decides how a harvest target's search is split to stay under
//! the upstream per-query result cap, and — given the target's resume state
//! — returns only the partitions still owed, with the in-flight partition
//! first so work continues exactly where it left off.

use folio_core::{HarvestConfig, HarvestTarget, PartitionKey, PartitionScheme, ResumeState};

/// An ordered plan of sub-queries for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionPlan {
    pub scheme: PartitionScheme,
    /// Partitions not yet completed, in-flight partition first.
    pub partitions: Vec<PartitionKey>,
}

/// Plan the remaining partitions for `target`.
///
/// Scheme selection: an explicit `scheme_override` wins (callers select
/// `by_letter`/`by_language` for targets whose year partitions are
/// themselves over-cap); otherwise a harvest that has already made progress
/// keeps the scheme recorded in its resume state, and a fresh target gets
/// `none` when its declared total fits under the cap or `by_year` when it
/// does not. Completed partitions are never re-planned.
pub fn plan(
    target: &HarvestTarget,
    state: &ResumeState,
    scheme_override: Option<PartitionScheme>,
    config: &HarvestConfig,
    current_year: i32,
) -> PartitionPlan {
    let started = !state.completed_partitions.is_empty() || state.current_partition.is_some();

    let scheme = if let Some(scheme) = scheme_override {
        scheme
    } else if started {
        // never change partitioning mid-flight; keys from different schemes
        // would stop lining up with the completed set
        state.scheme
    } else if target.declared_total <= config.result_cap {
        PartitionScheme::None
    } else {
        PartitionScheme::ByYear
    };

    let mut partitions: Vec<PartitionKey> = enumerate(scheme, config, current_year)
        .into_iter()
        .filter(|key| !state.is_completed(key))
        .collect();

    if let Some(current) = &state.current_partition {
        if let Some(pos) = partitions.iter().position(|key| key == current) {
            let key = partitions.remove(pos);
            partitions.insert(0, key);
        }
    }

    PartitionPlan { scheme, partitions }
}

/// Enumerate the full partition key set for a scheme.
fn enumerate(
    scheme: PartitionScheme,
    config: &HarvestConfig,
    current_year: i32,
) -> Vec<PartitionKey> {
    match scheme {
        PartitionScheme::None => vec![PartitionKey::All],
        PartitionScheme::ByYear => (config.year_floor..=current_year)
            .rev()
            .map(PartitionKey::Year)
            .collect(),
        PartitionScheme::ByLetter => ('a'..='z').map(PartitionKey::Letter).collect(),
        PartitionScheme::ByLanguage => config
            .languages
            .iter()
            .cloned()
            .map(PartitionKey::Language)
            .collect(),
    }
}
