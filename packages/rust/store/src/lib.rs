//! Postgres/pgvector storage layer.
//!
//! The [`Store`] struct wraps a `sqlx` connection pool for per-index chunk
//! tables, indexing jobs, session links, access grants, and the distributed
//! embed rate window. Schema migrations run once at connect time; per-index
//! `docs_<name>` tables are managed dynamically by [`Store::ensure_store`].

mod access;
mod jobs;
mod migrations;
mod ratewindow;
mod vector;

use sqlx::postgres::{PgPool, PgPoolOptions};

use docdex_shared::{DocdexError, Result};

pub use access::AccessGrant;
pub use jobs::{JobUpdate, NewJob};
pub use ratewindow::{DistributedRateLimiter, RateWindowQuotas};
pub use vector::{AnnHit, ChunkRecord};

/// Primary storage handle wrapping a Postgres connection pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to the vector store and apply pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Wrap an existing pool (tests).
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                sqlx::raw_sql(migration.sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        DocdexError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn schema_version(&self) -> u32 {
        let result: std::result::Result<Option<i32>, _> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await;

        match result {
            Ok(Some(version)) => version.max(0) as u32,
            // Table doesn't exist yet (or is empty).
            _ => 0,
        }
    }
}

/// Map a sqlx error into the shared storage error kind.
pub(crate) fn storage_err(e: sqlx::Error) -> DocdexError {
    DocdexError::Storage(e.to_string())
}
