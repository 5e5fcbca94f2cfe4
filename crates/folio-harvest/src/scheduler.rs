//! Bounded-concurrency harvest scheduler.
//!
//! Admission is a fixed-size permit pool: a job acquires a permit before
//! execution and the permit is released on every exit path, including
//! cancellation, because it rides an RAII guard owned by the job task. Jobs
//! touching an in-flight target are deferred at claim time, not run
//! concurrently, and job starts within one claim batch are staggered so a
//! burst of fresh jobs doesn't fire simultaneous first-page queries at the
//! upstream source. When the queue runs dry the scheduler invokes the gap
//! detector before idling.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use folio_core::{
    defaults, Error, GapConfig, HarvestConfig, HarvestJob, HarvestOutcome, JobProgress,
    JobRepository, Result, UpstreamSearch,
};

use crate::executor::{CancelFlag, HarvestExecutor};
use crate::gap::GapDetector;

/// Configuration for the harvest scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Concurrency permit pool size.
    pub max_concurrent: usize,
    /// Polling interval when the queue is empty, in milliseconds.
    pub poll_interval_ms: u64,
    /// Delay between job starts within one claim batch, in milliseconds.
    pub start_stagger_ms: u64,
    /// Minimum interval between gap-detector scans, in seconds.
    pub gap_scan_interval_secs: u64,
    /// Whether to process jobs at all.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::MAX_CONCURRENT_HARVESTS,
            poll_interval_ms: defaults::SCHEDULER_POLL_INTERVAL_MS,
            start_stagger_ms: defaults::START_STAGGER_MS,
            gap_scan_interval_secs: defaults::GAP_SCAN_INTERVAL_SECS,
            enabled: true,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `HARVEST_SCHEDULER_ENABLED` | `true` | Enable/disable job processing |
    /// | `HARVEST_MAX_CONCURRENT` | `5` | Concurrency permit pool size |
    /// | `HARVEST_POLL_INTERVAL_MS` | `2000` | Poll interval when queue is empty |
    /// | `HARVEST_START_STAGGER_MS` | `750` | Stagger between batch job starts |
    /// | `HARVEST_GAP_SCAN_INTERVAL_SECS` | `300` | Gap scan interval when idle |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("HARVEST_SCHEDULER_ENABLED") {
            config.enabled = val != "false" && val != "0";
        }
        if let Ok(val) = std::env::var("HARVEST_MAX_CONCURRENT") {
            match val.parse::<usize>() {
                Ok(n) => config.max_concurrent = n.max(1),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid HARVEST_MAX_CONCURRENT, using default")
                }
            }
        }
        if let Ok(val) = std::env::var("HARVEST_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.poll_interval_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("HARVEST_START_STAGGER_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.start_stagger_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("HARVEST_GAP_SCAN_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.gap_scan_interval_secs = secs;
            }
        }

        config
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_start_stagger(mut self, ms: u64) -> Self {
        self.start_stagger_ms = ms;
        self
    }

    pub fn with_gap_scan_interval(mut self, secs: u64) -> Self {
        self.gap_scan_interval_secs = secs;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the harvest scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// Scheduler started.
    SchedulerStarted,
    /// Scheduler stopped.
    SchedulerStopped,
    /// A job was claimed and started.
    JobStarted { job_id: Uuid },
    /// A running job merged another page.
    JobProgress { job_id: Uuid, progress: JobProgress },
    /// A job finished with the given outcome.
    JobCompleted {
        job_id: Uuid,
        outcome: HarvestOutcome,
    },
    /// A job failed.
    JobFailed { job_id: Uuid, error: String },
    /// A job observed its cancel flag and stopped at a checkpoint.
    JobCancelled { job_id: Uuid },
}

/// Handle for controlling a running scheduler.
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<SchedulerEvent>,
    cancel_flags: Arc<Mutex<HashMap<Uuid, CancelFlag>>>,
    jobs: Arc<dyn JobRepository>,
}

impl SchedulerHandle {
    /// Signal the scheduler loop to shut down. Jobs already running finish
    /// at their own pace; no new jobs are claimed.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_rx.resubscribe()
    }

    /// Cancel a job: pending jobs are cancelled in the store, running jobs
    /// get their cooperative flag set and stop at the next page boundary.
    /// Returns false if the job is unknown or already terminal.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        if self.jobs.cancel(job_id).await? {
            return Ok(true);
        }
        let flag = self
            .cancel_flags
            .lock()
            .expect("cancel registry poisoned")
            .get(&job_id)
            .cloned();
        match flag {
            Some(flag) => {
                flag.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Harvest scheduler: claims pending jobs and runs them under the permit
/// pool.
pub struct HarvestScheduler {
    jobs: Arc<dyn JobRepository>,
    executor: Arc<HarvestExecutor>,
    gap: Arc<GapDetector>,
    config: SchedulerConfig,
    event_tx: broadcast::Sender<SchedulerEvent>,
    permits: Arc<Semaphore>,
    /// Target ids with a running job; the explicit registry backing
    /// per-target mutual exclusion.
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    cancel_flags: Arc<Mutex<HashMap<Uuid, CancelFlag>>>,
}

impl HarvestScheduler {
    /// Create a new scheduler. The executor's progress callback is wired to
    /// the scheduler's event bus.
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        executor: HarvestExecutor,
        gap: GapDetector,
        config: SchedulerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);

        let progress_tx = event_tx.clone();
        let executor = executor.with_progress_callback(move |job_id, progress| {
            let _ = progress_tx.send(SchedulerEvent::JobProgress {
                job_id,
                progress: progress.clone(),
            });
        });

        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            jobs,
            executor: Arc::new(executor),
            gap: Arc::new(gap),
            config,
            event_tx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wire a scheduler over a live database and an upstream client.
    pub fn for_database(
        db: &folio_db::Database,
        upstream: Arc<dyn UpstreamSearch>,
        harvest_config: HarvestConfig,
        gap_config: GapConfig,
        config: SchedulerConfig,
    ) -> Self {
        let targets: Arc<dyn folio_core::TargetRepository> = Arc::new(db.targets.clone());
        let jobs: Arc<dyn JobRepository> = Arc::new(db.jobs.clone());

        let executor = HarvestExecutor::new(
            targets.clone(),
            Arc::new(db.citations.clone()),
            Arc::new(db.resume.clone()),
            Arc::new(db.query_log.clone()),
            jobs.clone(),
            upstream,
            harvest_config,
        );
        let gap = GapDetector::new(targets, jobs.clone(), gap_config);

        Self::new(jobs, executor, gap, config)
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Get the pending job count.
    pub async fn pending_count(&self) -> Result<i64> {
        self.jobs.pending_count().await
    }

    /// Start the scheduler and return a handle for control.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();
        let cancel_flags = self.cancel_flags.clone();
        let jobs = self.jobs.clone();

        let scheduler = Arc::new(self);
        tokio::spawn(async move {
            scheduler.run(&mut shutdown_rx).await;
        });

        SchedulerHandle {
            shutdown_tx,
            event_rx,
            cancel_flags,
            jobs,
        }
    }

    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!(subsystem = "scheduler", "Harvest scheduler is disabled, not starting");
            return;
        }

        info!(
            subsystem = "scheduler",
            max_concurrent = self.config.max_concurrent,
            poll_interval_ms = self.config.poll_interval_ms,
            "Harvest scheduler started"
        );
        let _ = self.event_tx.send(SchedulerEvent::SchedulerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let gap_interval = Duration::from_secs(self.config.gap_scan_interval_secs);
        let mut last_gap_scan: Option<Instant> = None;

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!(subsystem = "scheduler", "Shutdown signal received");
                break;
            }

            let claimed = self.claim_batch().await;
            if claimed > 0 {
                // permits may remain; try to claim more right away
                continue;
            }

            // queue is empty (or every remaining job is deferred); with
            // spare capacity, let the gap detector queue continuation work
            let spare_capacity = self.permits.available_permits() > 0;
            let scan_due = last_gap_scan.map_or(true, |at| at.elapsed() >= gap_interval);
            if spare_capacity && scan_due {
                last_gap_scan = Some(Instant::now());
                match self.gap.run_once().await {
                    Ok(enqueued) if enqueued > 0 => {
                        debug!(
                            subsystem = "scheduler",
                            enqueued, "Gap detector queued continuations"
                        );
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(subsystem = "scheduler", error = %e, "Gap scan failed");
                    }
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(subsystem = "scheduler", "Shutdown signal received");
                    break;
                }
                _ = sleep(poll_interval) => {}
            }
        }

        let _ = self.event_tx.send(SchedulerEvent::SchedulerStopped);
        info!(subsystem = "scheduler", "Harvest scheduler stopped");
    }

    /// Claim and spawn as many jobs as free permits allow. Returns the
    /// number of jobs started.
    async fn claim_batch(&self) -> usize {
        let mut claimed = 0usize;

        loop {
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let exclude: Vec<Uuid> = self
                .in_flight
                .lock()
                .expect("in-flight registry poisoned")
                .iter()
                .copied()
                .collect();

            match self.jobs.claim_next_excluding(&exclude).await {
                Ok(Some(job)) => {
                    self.in_flight
                        .lock()
                        .expect("in-flight registry poisoned")
                        .extend(job.target_ids.iter().copied());

                    let cancel = CancelFlag::new();
                    self.cancel_flags
                        .lock()
                        .expect("cancel registry poisoned")
                        .insert(job.id, cancel.clone());

                    let stagger = Duration::from_millis(
                        self.config.start_stagger_ms.saturating_mul(claimed as u64),
                    );
                    claimed += 1;

                    let runner = self.runner();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if !stagger.is_zero() {
                            sleep(stagger).await;
                        }
                        runner.run_job(job, cancel).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    break;
                }
                Err(e) => {
                    error!(subsystem = "scheduler", error = %e, "Failed to claim job");
                    drop(permit);
                    break;
                }
            }
        }

        claimed
    }

    fn runner(&self) -> JobRunner {
        JobRunner {
            jobs: self.jobs.clone(),
            executor: self.executor.clone(),
            event_tx: self.event_tx.clone(),
            in_flight: self.in_flight.clone(),
            cancel_flags: self.cancel_flags.clone(),
        }
    }
}

/// Reference bundle for executing a single claimed job in a spawned task.
struct JobRunner {
    jobs: Arc<dyn JobRepository>,
    executor: Arc<HarvestExecutor>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    cancel_flags: Arc<Mutex<HashMap<Uuid, CancelFlag>>>,
}

impl JobRunner {
    async fn run_job(self, job: HarvestJob, cancel: CancelFlag) {
        let start = Instant::now();
        let job_id = job.id;

        info!(
            subsystem = "scheduler",
            job_id = %job_id,
            targets = job.target_ids.len(),
            "Harvest job started"
        );
        let _ = self.event_tx.send(SchedulerEvent::JobStarted { job_id });

        let result = self.executor.execute(&job, &cancel).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(_) if cancel.is_cancelled() => {
                if let Err(e) = self.jobs.mark_cancelled(job_id).await {
                    error!(job_id = %job_id, error = %e, "Failed to mark job cancelled");
                } else {
                    info!(
                        subsystem = "scheduler",
                        job_id = %job_id,
                        duration_ms,
                        "Harvest job cancelled at checkpoint"
                    );
                    let _ = self.event_tx.send(SchedulerEvent::JobCancelled { job_id });
                }
            }
            Ok(outcome) => {
                if let Err(e) = self.jobs.complete(job_id, outcome).await {
                    error!(job_id = %job_id, error = %e, "Failed to mark job completed");
                } else {
                    info!(
                        subsystem = "scheduler",
                        job_id = %job_id,
                        outcome = %outcome,
                        duration_ms,
                        "Harvest job finished"
                    );
                    let _ = self
                        .event_tx
                        .send(SchedulerEvent::JobCompleted { job_id, outcome });
                }
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(e2) = self.jobs.fail(job_id, &reason).await {
                    error!(job_id = %job_id, error = %e2, "Failed to mark job failed");
                } else {
                    warn!(
                        subsystem = "scheduler",
                        job_id = %job_id,
                        error = %reason,
                        duration_ms,
                        "Harvest job failed"
                    );
                    let _ = self.event_tx.send(SchedulerEvent::JobFailed {
                        job_id,
                        error: reason,
                    });
                }
            }
        }

        // release per-target exclusivity and the cancel flag on every exit path
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight registry poisoned");
            for target_id in &job.target_ids {
                in_flight.remove(target_id);
            }
        }
        self.cancel_flags
            .lock()
            .expect("cancel registry poisoned")
            .remove(&job_id);
    }
}
