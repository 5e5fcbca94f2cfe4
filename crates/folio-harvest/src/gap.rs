//! Gap detection and auto-resume.
//!
//! The detector is the system's self-healing mechanism: harvests that ended
//! `partial` (timeouts, rate limits, restarts) leave a shortfall between a
//! target's declared and merged totals, and the detector re-enqueues
//! exactly the missing work. It runs cooperatively — the scheduler invokes
//! it only when it has spare capacity.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use folio_core::{
    GapConfig, HarvestTarget, JobRepository, NewHarvestJob, Result, TargetRepository,
};

/// Periodic scan selecting targets that need continuation harvests.
pub struct GapDetector {
    targets: Arc<dyn TargetRepository>,
    jobs: Arc<dyn JobRepository>,
    config: GapConfig,
}

impl GapDetector {
    pub fn new(
        targets: Arc<dyn TargetRepository>,
        jobs: Arc<dyn JobRepository>,
        config: GapConfig,
    ) -> Self {
        Self {
            targets,
            jobs,
            config,
        }
    }

    /// Targets whose shortfall clears both the absolute and the relative
    /// floor. Paused targets are never selected; requiring both floors keeps
    /// upstream count drift from producing false positives.
    pub async fn scan(&self) -> Result<Vec<HarvestTarget>> {
        let candidates = self
            .targets
            .list_incomplete(self.config.absolute_floor)
            .await?;

        let selected: Vec<HarvestTarget> = candidates
            .into_iter()
            .filter(|target| self.config.needs_continuation(target))
            .collect();

        debug!(
            subsystem = "gap",
            op = "scan",
            selected = selected.len(),
            "Gap scan finished"
        );
        Ok(selected)
    }

    /// Scan and enqueue continuation jobs, one per upstream entity.
    ///
    /// Sibling targets sharing a `source_key` are grouped into a single job
    /// so shared upstream results are fetched once, and enqueueing is
    /// deduplicated against jobs already pending or running for the same
    /// entity. Returns the number of jobs actually enqueued.
    pub async fn run_once(&self) -> Result<usize> {
        let selected = self.scan().await?;
        if selected.is_empty() {
            return Ok(0);
        }

        let mut groups: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for target in &selected {
            groups
                .entry(target.source_key.clone())
                .or_default()
                .push(target.id);
        }

        let mut enqueued = 0usize;
        for (source_key, target_ids) in groups {
            let targets = target_ids.len();
            match self
                .jobs
                .enqueue_deduplicated(NewHarvestJob::for_group(source_key.clone(), target_ids))
                .await?
            {
                Some(job_id) => {
                    info!(
                        subsystem = "gap",
                        job_id = %job_id,
                        source_key = %source_key,
                        targets,
                        "Continuation job enqueued"
                    );
                    enqueued += 1;
                }
                None => {
                    debug!(
                        subsystem = "gap",
                        source_key = %source_key,
                        "Continuation already queued, skipping"
                    );
                }
            }
        }
        Ok(enqueued)
    }
}
