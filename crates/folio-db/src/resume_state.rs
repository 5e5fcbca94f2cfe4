//! Resume state persistence.
//!
//! The cursor is stored as one JSONB document per target and upserted after
//! every page. State is never reconstructed from citation counts; the stored
//! document is the only source of truth for where paging stopped.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use folio_core::{Error, Result, ResumeState, ResumeStateRepository};

/// PostgreSQL implementation of [`ResumeStateRepository`].
#[derive(Clone)]
pub struct PgResumeStateRepository {
    pool: PgPool,
}

impl PgResumeStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResumeStateRepository for PgResumeStateRepository {
    async fn load(&self, target_id: Uuid) -> Result<ResumeState> {
        let stored: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT state FROM resume_state WHERE target_id = $1")
                .bind(target_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        match stored {
            Some((value,)) => match serde_json::from_value::<ResumeState>(value) {
                Ok(state) => Ok(state),
                Err(e) => {
                    tracing::warn!(
                        subsystem = "db",
                        component = "resume_state",
                        target_id = %target_id,
                        error = %e,
                        "Unreadable resume state, treating target as fresh"
                    );
                    Ok(ResumeState::default())
                }
            },
            None => Ok(ResumeState::default()),
        }
    }

    async fn save(&self, target_id: Uuid, state: &ResumeState) -> Result<()> {
        let value = serde_json::to_value(state)?;

        sqlx::query(
            "INSERT INTO resume_state (target_id, state, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (target_id) DO UPDATE SET state = $2, updated_at = $3",
        )
        .bind(target_id)
        .bind(&value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }
}
