//! Harvest target repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use folio_core::{
    Error, HarvestTarget, NewHarvestTarget, PartitionScheme, Result, TargetRepository,
};

/// PostgreSQL implementation of [`TargetRepository`].
#[derive(Clone)]
pub struct PgTargetRepository {
    pool: PgPool,
}

impl PgTargetRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> HarvestTarget {
        let scheme_override: Option<String> = row.get("scheme_override");
        HarvestTarget {
            id: row.get("id"),
            source_key: row.get("source_key"),
            query: row.get("query"),
            declared_total: row.get("declared_total"),
            merged_total: row.get("merged_total"),
            scheme_override: scheme_override.as_deref().and_then(PartitionScheme::parse),
            harvest_paused: row.get("harvest_paused"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

const TARGET_COLUMNS: &str = "id, source_key, query, declared_total, merged_total, \
                              scheme_override, harvest_paused, created_at, updated_at";

#[async_trait]
impl TargetRepository for PgTargetRepository {
    async fn create(&self, req: NewHarvestTarget) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO harvest_target
                 (id, source_key, query, declared_total, merged_total, harvest_paused,
                  created_at, updated_at)
             VALUES ($1, $2, $3, $4, 0, false, $5, $5)",
        )
        .bind(id)
        .bind(&req.source_key)
        .bind(&req.query)
        .bind(req.declared_total)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<HarvestTarget>> {
        let row = sqlx::query(&format!(
            "SELECT {TARGET_COLUMNS} FROM harvest_target WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_row))
    }

    async fn list(&self) -> Result<Vec<HarvestTarget>> {
        let rows = sqlx::query(&format!(
            "SELECT {TARGET_COLUMNS} FROM harvest_target ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_row).collect())
    }

    async fn list_incomplete(&self, min_gap: i64) -> Result<Vec<HarvestTarget>> {
        let rows = sqlx::query(&format!(
            "SELECT {TARGET_COLUMNS} FROM harvest_target
             WHERE NOT harvest_paused
               AND declared_total - merged_total > $1
             ORDER BY declared_total - merged_total DESC"
        ))
        .bind(min_gap)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_row).collect())
    }

    async fn add_merged(&self, id: Uuid, delta: u64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE harvest_target
             SET merged_total = merged_total + $1, updated_at = $2
             WHERE id = $3",
        )
        .bind(delta as i64)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::TargetNotFound(id));
        }
        Ok(())
    }

    async fn set_declared_total(&self, id: Uuid, declared_total: i64) -> Result<()> {
        sqlx::query(
            "UPDATE harvest_target SET declared_total = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(declared_total)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn set_scheme_override(&self, id: Uuid, scheme: Option<PartitionScheme>) -> Result<()> {
        sqlx::query(
            "UPDATE harvest_target SET scheme_override = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(scheme.map(PartitionScheme::as_str))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<()> {
        sqlx::query("UPDATE harvest_target SET harvest_paused = $1, updated_at = $2 WHERE id = $3")
            .bind(paused)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn reset_harvest(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let result =
            sqlx::query("UPDATE harvest_target SET merged_total = 0, updated_at = $1 WHERE id = $2")
                .bind(Utc::now())
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::TargetNotFound(id));
        }

        sqlx::query("DELETE FROM resume_state WHERE target_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        sqlx::query("DELETE FROM citation WHERE target_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        tracing::info!(
            subsystem = "db",
            component = "targets",
            op = "reset_harvest",
            target_id = %id,
            "Target reset for full re-harvest"
        );
        Ok(())
    }
}
