//! Harvest job repository implementation.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so multiple scheduler instances
//! can share one queue, and the claim query excludes jobs whose target set
//! overlaps the caller's in-flight targets — that exclusion is what defers a
//! second job for an already-running target instead of running it
//! concurrently.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use folio_core::{
    Error, HarvestJob, HarvestOutcome, JobProgress, JobRepository, JobStatus, NewHarvestJob,
    QueueStats, Result,
};

/// PostgreSQL implementation of [`JobRepository`].
#[derive(Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

const JOB_COLUMNS: &str = "id, target_ids, source_key, priority, status, outcome, \
                           error_message, progress, created_at, started_at, completed_at";

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> HarvestJob {
        let status: String = row.get("status");
        let outcome: Option<String> = row.get("outcome");
        let progress: Option<serde_json::Value> = row.get("progress");

        HarvestJob {
            id: row.get("id"),
            target_ids: row.get("target_ids"),
            source_key: row.get("source_key"),
            priority: row.get("priority"),
            status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
            outcome: outcome.as_deref().and_then(HarvestOutcome::parse),
            error_message: row.get("error_message"),
            progress: progress.and_then(|v| serde_json::from_value(v).ok()),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(&self, req: NewHarvestJob) -> Result<Uuid> {
        if req.target_ids.is_empty() {
            return Err(Error::InvalidInput("job has no targets".to_string()));
        }

        let job_id = Uuid::now_v7();

        sqlx::query(
            "INSERT INTO harvest_job (id, target_ids, source_key, priority, status, created_at)
             VALUES ($1, $2, $3, $4, 'pending', $5)",
        )
        .bind(job_id)
        .bind(&req.target_ids)
        .bind(&req.source_key)
        .bind(req.priority)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(job_id)
    }

    async fn enqueue_deduplicated(&self, req: NewHarvestJob) -> Result<Option<Uuid>> {
        if req.target_ids.is_empty() {
            return Err(Error::InvalidInput("job has no targets".to_string()));
        }

        let job_id = Uuid::now_v7();

        // Atomic check-and-insert; prevents a TOCTOU race when concurrent
        // gap scans try to queue the same continuation.
        let inserted = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO harvest_job (id, target_ids, source_key, priority, status, created_at)
             SELECT $1, $2, $3, $4, 'pending', $5
             WHERE NOT EXISTS (
                 SELECT 1 FROM harvest_job
                 WHERE source_key = $3 AND status IN ('pending', 'running')
             )
             RETURNING id",
        )
        .bind(job_id)
        .bind(&req.target_ids)
        .bind(&req.source_key)
        .bind(req.priority)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(inserted)
    }

    async fn claim_next_excluding(&self, exclude_targets: &[Uuid]) -> Result<Option<HarvestJob>> {
        let row = sqlx::query(&format!(
            "UPDATE harvest_job
             SET status = 'running', started_at = $1
             WHERE id = (
                 SELECT id FROM harvest_job
                 WHERE status = 'pending'
                   AND NOT (target_ids && $2::uuid[])
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(exclude_targets)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_row))
    }

    async fn update_progress(&self, job_id: Uuid, progress: &JobProgress) -> Result<()> {
        let value = serde_json::to_value(progress)?;

        sqlx::query("UPDATE harvest_job SET progress = $1 WHERE id = $2 AND status = 'running'")
            .bind(&value)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, outcome: HarvestOutcome) -> Result<()> {
        sqlx::query(
            "UPDATE harvest_job
             SET status = 'completed', outcome = $1, completed_at = $2
             WHERE id = $3 AND status = 'running'",
        )
        .bind(outcome.as_str())
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE harvest_job
             SET status = 'failed', outcome = 'failed', error_message = $1, completed_at = $2
             WHERE id = $3 AND status = 'running'",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE harvest_job
             SET status = 'cancelled', completed_at = $1
             WHERE id = $2 AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_cancelled(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE harvest_job
             SET status = 'cancelled', completed_at = $1
             WHERE id = $2 AND status = 'running'",
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<HarvestJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM harvest_job WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_row))
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM harvest_job WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<HarvestJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM harvest_job ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_row).collect())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'running') as running,
                COUNT(*) FILTER (WHERE status = 'completed'
                                   AND completed_at > NOW() - INTERVAL '1 hour')
                    as completed_last_hour,
                COUNT(*) FILTER (WHERE status = 'failed'
                                   AND completed_at > NOW() - INTERVAL '1 hour')
                    as failed_last_hour,
                COUNT(*) as total
             FROM harvest_job",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get::<i64, _>("pending"),
            running: row.get::<i64, _>("running"),
            completed_last_hour: row.get::<i64, _>("completed_last_hour"),
            failed_last_hour: row.get::<i64, _>("failed_last_hour"),
            total: row.get::<i64, _>("total"),
        })
    }
}

#[cfg(test)]
mod tests {
    use folio_core::{HarvestOutcome, JobStatus};

    // The status/outcome string forms are part of the table contract; a
    // rename here would silently strand rows written by older builds.

    #[test]
    fn job_status_strings_match_schema() {
        assert_eq!(JobStatus::Pending.as_str(), "pending");
        assert_eq!(JobStatus::Running.as_str(), "running");
        assert_eq!(JobStatus::Completed.as_str(), "completed");
        assert_eq!(JobStatus::Failed.as_str(), "failed");
        assert_eq!(JobStatus::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn outcome_strings_match_schema() {
        assert_eq!(HarvestOutcome::Completed.as_str(), "completed");
        assert_eq!(HarvestOutcome::Partial.as_str(), "partial");
        assert_eq!(HarvestOutcome::Failed.as_str(), "failed");
    }

    #[test]
    fn job_status_strings_are_unique() {
        let strings = [
            JobStatus::Pending.as_str(),
            JobStatus::Running.as_str(),
            JobStatus::Completed.as_str(),
            JobStatus::Failed.as_str(),
            JobStatus::Cancelled.as_str(),
        ];
        let mut unique = strings.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(strings.len(), unique.len());
    }
}
