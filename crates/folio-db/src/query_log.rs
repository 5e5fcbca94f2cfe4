//! Query audit log repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use folio_core::{
    Error, NewQueryLogEntry, PartitionScheme, QueryLogEntry, QueryLogRepository, Result,
};

/// PostgreSQL implementation of [`QueryLogRepository`].
#[derive(Clone)]
pub struct PgQueryLogRepository {
    pool: PgPool,
}

impl PgQueryLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> QueryLogEntry {
        let partition_type: String = row.get("partition_type");
        QueryLogEntry {
            id: row.get("id"),
            target_id: row.get("target_id"),
            job_id: row.get("job_id"),
            query: row.get("query"),
            partition_type: PartitionScheme::parse(&partition_type)
                .unwrap_or(PartitionScheme::None),
            partition_value: row.get("partition_value"),
            page_number: row.get("page_number"),
            results_count: row.get("results_count"),
            success: row.get("success"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl QueryLogRepository for PgQueryLogRepository {
    async fn append(&self, entry: NewQueryLogEntry) -> Result<Uuid> {
        let id = Uuid::now_v7();

        sqlx::query(
            "INSERT INTO query_log
                 (id, target_id, job_id, query, partition_type, partition_value,
                  page_number, results_count, success, error_message, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(id)
        .bind(entry.target_id)
        .bind(entry.job_id)
        .bind(&entry.query)
        .bind(entry.partition_type.as_str())
        .bind(&entry.partition_value)
        .bind(entry.page_number)
        .bind(entry.results_count)
        .bind(entry.success)
        .bind(&entry.error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(id)
    }

    async fn list_for_target(&self, target_id: Uuid, limit: i64) -> Result<Vec<QueryLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, target_id, job_id, query, partition_type, partition_value,
                    page_number, results_count, success, error_message, created_at
             FROM query_log
             WHERE target_id = $1
             ORDER BY created_at DESC
             LIMIT $2",
        )
        .bind(target_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_row).collect())
    }
}
