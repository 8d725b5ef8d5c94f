//! Durable indexing-job rows and their state machine.
//!
//! Counter updates are monotonic (`GREATEST` against the stored value), the
//! first terminal transition wins and stamps `completed_at`/
//! `duration_seconds`, and updates against an already-terminal job are
//! no-ops.

use sqlx::Row;
use sqlx::postgres::PgRow;

use docdex_shared::{Identity, IndexName, IndexingJob, JobProgress, JobStatus, Result, Scope};

use crate::{Store, storage_err};

/// SQL list of terminal states, used in transition guards.
const TERMINAL_STATES: &str = "('completed', 'failed', 'timeout', 'cancelled')";

/// Fields for creating a job row.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    /// Externally supplied id (maps to the workflow id of the durable
    /// execution engine).
    pub job_id: &'a str,
    pub index_name: &'a IndexName,
    pub source_url: &'a str,
    pub identity: &'a Identity,
    pub metadata: Option<serde_json::Value>,
}

/// A status transition with optional counters and failure details.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<JobProgress>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: JobProgress) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: JobProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(
        mut self,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        self.error_message = Some(message.into());
        self.error_details = details;
        self
    }
}

impl Store {
    /// Create a job row in the `started` state.
    pub async fn create_job(&self, job: NewJob<'_>) -> Result<()> {
        job.identity.validate()?;
        sqlx::query(
            "INSERT INTO indexing_jobs
               (job_id, index_name, source_url, status, scope,
                initiated_by_user, initiated_by_team, metadata)
             VALUES ($1, $2, $3, 'started', $4, $5, $6, $7)",
        )
        .bind(job.job_id)
        .bind(job.index_name.as_str())
        .bind(job.source_url)
        .bind(job.identity.scope.as_str())
        .bind(&job.identity.user_id)
        .bind(&job.identity.team_id)
        .bind(&job.metadata)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Apply a status/progress update.
    ///
    /// Returns `false` when the job was already terminal (the update is
    /// ignored; first terminal writer wins) or does not exist.
    pub async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<bool> {
        let progress = update.progress;
        let status = update.status.map(JobStatus::as_str);

        let result = sqlx::query(&format!(
            "UPDATE indexing_jobs SET
               status = COALESCE($2, status),
               pages_discovered = GREATEST(pages_discovered, COALESCE($3, pages_discovered)),
               pages_processed  = GREATEST(pages_processed,  COALESCE($4, pages_processed)),
               pages_indexed    = GREATEST(pages_indexed,    COALESCE($5, pages_indexed)),
               total_chunks     = GREATEST(total_chunks,     COALESCE($6, total_chunks)),
               error_message = COALESCE($7, error_message),
               error_details = COALESCE($8, error_details),
               completed_at = CASE
                 WHEN $2 IN {TERMINAL_STATES} THEN now()
                 ELSE completed_at
               END,
               duration_seconds = CASE
                 WHEN $2 IN {TERMINAL_STATES}
                   THEN CAST(EXTRACT(EPOCH FROM (now() - started_at)) AS BIGINT)
                 ELSE duration_seconds
               END
             WHERE job_id = $1 AND status NOT IN {TERMINAL_STATES}"
        ))
        .bind(job_id)
        .bind(status)
        .bind(progress.map(|p| p.pages_discovered))
        .bind(progress.map(|p| p.pages_processed))
        .bind(progress.map(|p| p.pages_indexed))
        .bind(progress.map(|p| p.total_chunks))
        .bind(&update.error_message)
        .bind(&update.error_details)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<IndexingJob>> {
        let row = sqlx::query("SELECT * FROM indexing_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    /// List jobs initiated by an identity, newest first. `limit` is clamped
    /// to `[1, 50]`.
    pub async fn list_jobs_by_identity(
        &self,
        identity: &Identity,
        limit: i64,
    ) -> Result<Vec<IndexingJob>> {
        identity.validate()?;
        let limit = limit.clamp(1, 50);

        let (column, subject) = match identity.scope {
            Scope::User => ("initiated_by_user", identity.user_id.as_deref()),
            Scope::Team => ("initiated_by_team", identity.team_id.as_deref()),
        };

        let rows = sqlx::query(&format!(
            "SELECT * FROM indexing_jobs
             WHERE scope = $1 AND {column} = $2
             ORDER BY started_at DESC
             LIMIT $3"
        ))
        .bind(identity.scope.as_str())
        .bind(subject)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(row_to_job).collect()
    }

    /// Delete terminal jobs older than the retention window. Returns the
    /// number of pruned rows.
    pub async fn prune_jobs(&self, retention_days: u32) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM indexing_jobs
             WHERE status IN {TERMINAL_STATES}
               AND completed_at < now() - make_interval(days => $1)"
        ))
        .bind(i32::try_from(retention_days).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }
}

fn row_to_job(row: &PgRow) -> Result<IndexingJob> {
    let status: String = row.try_get("status").map_err(storage_err)?;
    let scope: String = row.try_get("scope").map_err(storage_err)?;

    Ok(IndexingJob {
        job_id: row.try_get("job_id").map_err(storage_err)?,
        index_name: row.try_get("index_name").map_err(storage_err)?,
        source_url: row.try_get("source_url").map_err(storage_err)?,
        status: status.parse::<JobStatus>()?,
        scope: scope.parse::<Scope>()?,
        initiated_by_user: row.try_get("initiated_by_user").map_err(storage_err)?,
        initiated_by_team: row.try_get("initiated_by_team").map_err(storage_err)?,
        started_at: row.try_get("started_at").map_err(storage_err)?,
        completed_at: row.try_get("completed_at").map_err(storage_err)?,
        duration_seconds: row.try_get("duration_seconds").map_err(storage_err)?,
        progress: JobProgress {
            pages_discovered: row.try_get("pages_discovered").map_err(storage_err)?,
            pages_processed: row.try_get("pages_processed").map_err(storage_err)?,
            pages_indexed: row.try_get("pages_indexed").map_err(storage_err)?,
            total_chunks: row.try_get("total_chunks").map_err(storage_err)?,
        },
        error_message: row.try_get("error_message").map_err(storage_err)?,
        error_details: row.try_get("error_details").map_err(storage_err)?,
        metadata: row.try_get("metadata").map_err(storage_err)?,
    })
}
