//! Citation merge store implementation.
//!
//! The merge is an idempotent upsert keyed on `(target_id, external_id)`.
//! `merge_page` returns the exact count of newly inserted rows; rows that
//! conflicted with already-stored records do not count.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use folio_core::{CitationRecord, CitationStore, Error, Result};

/// PostgreSQL implementation of [`CitationStore`].
#[derive(Clone)]
pub struct PgCitationStore {
    pool: PgPool,
}

impl PgCitationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CitationStore for PgCitationStore {
    async fn merge_page(&self, target_id: Uuid, records: &[CitationRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut newly_added = 0u64;

        for record in records {
            let result = sqlx::query(
                "INSERT INTO citation
                     (id, target_id, external_id, title, authors, year, language, url,
                      snippet, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (target_id, external_id) DO NOTHING",
            )
            .bind(Uuid::now_v7())
            .bind(target_id)
            .bind(&record.external_id)
            .bind(&record.title)
            .bind(&record.authors)
            .bind(record.year)
            .bind(&record.language)
            .bind(&record.url)
            .bind(&record.snippet)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            newly_added += result.rows_affected();
        }

        tx.commit().await.map_err(Error::Database)?;

        tracing::trace!(
            subsystem = "db",
            component = "citations",
            op = "merge_page",
            target_id = %target_id,
            result_count = records.len(),
            new_count = newly_added,
            "Merged citation page"
        );
        Ok(newly_added)
    }

    async fn count_for_target(&self, target_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM citation WHERE target_id = $1")
            .bind(target_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(count)
    }
}
