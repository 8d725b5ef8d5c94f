//! Per-index chunk table lifecycle, upserts, and ANN search.

use pgvector::Vector;
use sqlx::Row;
use tracing::{info, warn};

use docdex_shared::{DocdexError, IndexName, Result};

use crate::{Store, storage_err};

/// Dimension ceiling for the IVFFlat fallback index.
const IVFFLAT_MAX_DIMENSION: usize = 2000;

/// One chunk row to upsert.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// Canonical page URL suffixed with `#<md5 of content>`.
    pub url: String,
    pub title: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
}

/// One ANN search result.
#[derive(Debug, Clone)]
pub struct AnnHit {
    pub url: String,
    pub title: String,
    pub content: String,
    /// `1 − cosine distance`.
    pub score: f32,
}

/// Double-quoted table identifier for an index. Index names are validated to
/// `[a-z0-9-]`, so quoting makes them safe to splice into DDL.
fn quoted_table(index: &IndexName) -> String {
    format!("\"{}\"", index.table())
}

impl Store {
    /// Ensure the chunk table for `index` exists with the given vector
    /// dimension.
    ///
    /// A pre-existing table with a different declared dimension is dropped
    /// and recreated (explicit data loss; re-ingest repopulates it). The ANN
    /// index prefers HNSW, falls back to IVFFlat for dimensions ≤ 2000, and
    /// is skipped entirely otherwise (queries degrade to a linear scan).
    pub async fn ensure_store(&self, index: &IndexName, dimension: usize) -> Result<()> {
        if dimension == 0 {
            return Err(DocdexError::validation("vector dimension must be non-zero"));
        }
        let table = quoted_table(index);

        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        // pgvector stores the declared dimension in atttypmod.
        let existing: Option<i32> = sqlx::query_scalar(
            "SELECT a.atttypmod FROM pg_attribute a
             WHERE a.attrelid = to_regclass($1) AND a.attname = 'embedding'",
        )
        .bind(&table)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        if let Some(existing) = existing {
            if existing != dimension as i32 {
                warn!(
                    index = %index,
                    existing,
                    wanted = dimension,
                    "vector dimension changed, dropping chunk table"
                );
                sqlx::raw_sql(&format!("DROP TABLE {table}"))
                    .execute(&self.pool)
                    .await
                    .map_err(storage_err)?;
            }
        }

        sqlx::raw_sql(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id         BIGSERIAL PRIMARY KEY,
                url        TEXT NOT NULL UNIQUE,
                title      TEXT NOT NULL,
                content    TEXT NOT NULL,
                embedding  VECTOR({dimension}) NOT NULL,
                metadata   JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        self.ensure_ann_index(index, dimension).await?;

        sqlx::raw_sql(&format!(
            "CREATE INDEX IF NOT EXISTS \"{0}_url_idx\" ON {table} (url)",
            index.table()
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn ensure_ann_index(&self, index: &IndexName, dimension: usize) -> Result<()> {
        let table = quoted_table(index);
        let ann_name = format!("{}_embedding_idx", index.table());

        let hnsw = sqlx::raw_sql(&format!(
            "CREATE INDEX IF NOT EXISTS \"{ann_name}\" ON {table}
             USING hnsw (embedding vector_cosine_ops)"
        ))
        .execute(&self.pool)
        .await;

        match hnsw {
            Ok(_) => Ok(()),
            Err(e) if dimension <= IVFFLAT_MAX_DIMENSION => {
                info!(index = %index, error = %e, "HNSW unavailable, falling back to IVFFlat");
                sqlx::raw_sql(&format!(
                    "CREATE INDEX IF NOT EXISTS \"{ann_name}\" ON {table}
                     USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)"
                ))
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
                Ok(())
            }
            Err(e) => {
                warn!(
                    index = %index,
                    dimension,
                    error = %e,
                    "no ANN index available for this dimension; queries will scan"
                );
                Ok(())
            }
        }
    }

    /// Insert a chunk, or update `title/content/embedding/metadata` when the
    /// `url` already exists.
    pub async fn upsert_chunk(&self, index: &IndexName, chunk: &ChunkRecord) -> Result<()> {
        let table = quoted_table(index);
        sqlx::query(&format!(
            "INSERT INTO {table} (url, title, content, embedding, metadata)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (url) DO UPDATE SET
               title = excluded.title,
               content = excluded.content,
               embedding = excluded.embedding,
               metadata = excluded.metadata"
        ))
        .bind(&chunk.url)
        .bind(&chunk.title)
        .bind(&chunk.content)
        .bind(Vector::from(chunk.embedding.clone()))
        .bind(&chunk.metadata)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// ANN search by cosine distance, ascending; ties broken by ascending
    /// `url`. Returns `score = 1 − distance`.
    pub async fn ann_search(
        &self,
        index: &IndexName,
        query: &[f32],
        k: i64,
    ) -> Result<Vec<AnnHit>> {
        let table = quoted_table(index);
        let rows = sqlx::query(&format!(
            "SELECT url, title, content, (embedding <=> $1) AS distance
             FROM {table}
             ORDER BY embedding <=> $1 ASC, url ASC
             LIMIT $2"
        ))
        .bind(Vector::from(query.to_vec()))
        .bind(k)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                let distance: f64 = row.try_get("distance").map_err(storage_err)?;
                Ok(AnnHit {
                    url: row.try_get("url").map_err(storage_err)?,
                    title: row.try_get("title").map_err(storage_err)?,
                    content: row.try_get("content").map_err(storage_err)?,
                    score: (1.0 - distance) as f32,
                })
            })
            .collect()
    }

    /// Drop the chunk table for an index, if it exists.
    pub async fn drop_index(&self, index: &IndexName) -> Result<()> {
        sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {}", quoted_table(index)))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
