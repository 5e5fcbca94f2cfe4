//! # folio-db
//!
//! PostgreSQL persistence layer for the folio harvesting engine.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for targets, citations, resume state,
//!   the query audit log, and the job queue
//! - Embedded schema migrations
//!
//! Every repository call is individually atomic; the engine layers its own
//! invariants (merge-then-advance ordering, monotonic counters) on top.
//!
//! ## Example
//!
//! ```rust,ignore
//! use folio_db::Database;
//! use folio_core::{NewHarvestTarget, TargetRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/folio").await?;
//!
//!     let target_id = db.targets.create(NewHarvestTarget {
//!         source_key: "cluster-8412".to_string(),
//!         query: "\"Mrs Dalloway\" Woolf".to_string(),
//!         declared_total: 0,
//!     }).await?;
//!
//!     println!("Registered target: {}", target_id);
//!     Ok(())
//! }
//! ```

pub mod citations;
pub mod jobs;
pub mod pool;
pub mod query_log;
pub mod resume_state;
pub mod targets;

// Re-export core types
pub use folio_core::*;

// Re-export repository implementations
pub use citations::PgCitationStore;
pub use jobs::PgJobRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use query_log::PgQueryLogRepository;
pub use resume_state::PgResumeStateRepository;
pub use targets::PgTargetRepository;

use sqlx::PgPool;

/// Aggregate handle over every repository, sharing one connection pool.
#[derive(Clone)]
pub struct Database {
    pub targets: PgTargetRepository,
    pub citations: PgCitationStore,
    pub resume: PgResumeStateRepository,
    pub query_log: PgQueryLogRepository,
    pub jobs: PgJobRepository,
    pool: PgPool,
}

impl Database {
    /// Connect with default pool configuration and build all repositories.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        Ok(Self::from_pool(pool))
    }

    /// Build all repositories over an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            targets: PgTargetRepository::new(pool.clone()),
            citations: PgCitationStore::new(pool.clone()),
            resume: PgResumeStateRepository::new(pool.clone()),
            query_log: PgQueryLogRepository::new(pool.clone()),
            jobs: PgJobRepository::new(pool.clone()),
            pool,
        }
    }

    /// Run embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        run_migrations(&self.pool).await
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Apply all embedded migrations to the given pool.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))
}
