//! Operations facade consumed by transports.
//!
//! [`Docdex`] bundles the store, embedder, and limiter behind the operation
//! set from the tool surface: `link`, `grant`, `list_accessible_indexes`,
//! `start_html_ingest`, `start_pdf_ingest`, `job_status`, `list_jobs`,
//! `search`, and `embedding_config`. Transports (MCP, HTTP, CLI) stay thin
//! wrappers over these calls.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use url::Url;
use uuid::Uuid;

use docdex_embed::{EmbeddingClient, LimiterConfig, RateLimiter, RetryPolicy};
use docdex_extract::ChunkOptions;
use docdex_shared::{
    AppConfig, CrawlConfig, DocdexError, Identity, IndexName, IndexingJob, JobProgress, Result,
    SearchHit,
};
use docdex_store::{
    AccessGrant, DistributedRateLimiter, NewJob, RateWindowQuotas, Store,
};

use crate::pipeline::{self, IngestOptions, PipelineDeps, ProgressReporter};
use crate::query;

/// Default overall deadline for one ingest attempt.
const DEFAULT_JOB_DEADLINE: Duration = Duration::from_secs(60 * 60);

/// Embedding configuration as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingInfo {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
}

/// The docdex service: configuration plus connected collaborators.
pub struct Docdex {
    config: AppConfig,
    deps: PipelineDeps,
}

impl Docdex {
    /// Validate configuration (secrets fail fast), connect to the store,
    /// and build the embedding stack.
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let database_url = config.database_url()?;
        let api_key = config.embedding_api_key()?;

        let store = Store::connect(&database_url).await?;
        let embedder = EmbeddingClient::from_config(&config.embedding, api_key)?;
        let limiter = RateLimiter::new(LimiterConfig {
            requests_per_minute: config.embedding.requests_per_minute,
            tokens_per_minute: config.embedding.tokens_per_minute,
            tokens_per_day: config.embedding.tokens_per_day,
        });
        let distributed = config.embedding.distributed.then(|| {
            DistributedRateLimiter::new(
                store.pool().clone(),
                RateWindowQuotas {
                    requests_per_minute: config.embedding.requests_per_minute,
                    tokens_per_minute: config.embedding.tokens_per_minute,
                    tokens_per_day: config.embedding.tokens_per_day,
                },
            )
        });
        let retry = RetryPolicy::new(
            config.embedding.max_retries,
            Duration::from_millis(config.embedding.initial_backoff_ms),
        );

        info!(
            provider = %config.embedding.provider,
            model = %config.embedding.model,
            distributed = config.embedding.distributed,
            "docdex service connected"
        );

        Ok(Self {
            config,
            deps: PipelineDeps {
                store,
                embedder: Arc::new(embedder),
                limiter: Arc::new(limiter),
                distributed,
                retry,
            },
        })
    }

    pub fn store(&self) -> &Store {
        &self.deps.store
    }

    /// Ingest options derived from the configuration.
    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            crawl: CrawlConfig::from(&self.config),
            chunking: ChunkOptions::default(),
            batch_size: self.config.embedding.batch_size.max(1),
            deadline: Some(DEFAULT_JOB_DEADLINE),
        }
    }

    // -----------------------------------------------------------------------
    // Identity and access
    // -----------------------------------------------------------------------

    /// Link a session id to an identity.
    pub async fn link(&self, session_id: &str, identity: &Identity) -> Result<()> {
        self.deps.store.link_session(session_id, identity).await
    }

    /// Upsert an access grant.
    pub async fn grant(&self, grant: &AccessGrant) -> Result<()> {
        self.deps.store.grant_access(grant).await
    }

    /// Index names the session's identity can read.
    pub async fn list_accessible_indexes(&self, session_id: &str) -> Result<Vec<String>> {
        let identity = self.deps.store.session_identity(session_id).await?;
        self.deps.store.accessible_indexes(&identity).await
    }

    // -----------------------------------------------------------------------
    // Ingest jobs
    // -----------------------------------------------------------------------

    /// Create a job row for an HTML ingest and return its id. The caller
    /// (or an external durable-execution engine) drives it with
    /// [`Docdex::run_html_ingest`].
    pub async fn start_html_ingest(&self, session_id: &str, source_url: &Url) -> Result<String> {
        self.create_job(session_id, source_url).await
    }

    /// Create a job row for a PDF ingest and return its id.
    pub async fn start_pdf_ingest(&self, session_id: &str, pdf_url: &Url) -> Result<String> {
        self.create_job(session_id, pdf_url).await
    }

    async fn create_job(&self, session_id: &str, source_url: &Url) -> Result<String> {
        let identity = self.deps.store.session_identity(session_id).await?;
        let index = IndexName::derive(source_url)?;
        let job_id = Uuid::now_v7().to_string();

        self.deps
            .store
            .create_job(NewJob {
                job_id: &job_id,
                index_name: &index,
                source_url: source_url.as_str(),
                identity: &identity,
                metadata: None,
            })
            .await?;

        Ok(job_id)
    }

    /// Execute an HTML ingest attempt against an existing job row. Safe to
    /// re-run for the same job: chunk upserts are idempotent.
    pub async fn run_html_ingest(
        &self,
        job_id: &str,
        source_url: &Url,
        progress: &dyn ProgressReporter,
        cancel: watch::Receiver<bool>,
    ) -> Result<JobProgress> {
        pipeline::run_html_ingest(
            &self.deps,
            &self.ingest_options(),
            source_url,
            job_id,
            progress,
            cancel,
        )
        .await
    }

    /// Execute a PDF ingest attempt against an existing job row.
    pub async fn run_pdf_ingest(
        &self,
        job_id: &str,
        pdf_url: &Url,
        progress: &dyn ProgressReporter,
    ) -> Result<JobProgress> {
        pipeline::run_pdf_ingest(&self.deps, &self.ingest_options(), pdf_url, job_id, progress)
            .await
    }

    /// Fetch a job row verbatim (status, counters, failure details).
    pub async fn job_status(&self, session_id: &str, job_id: &str) -> Result<Option<IndexingJob>> {
        // Resolving the identity enforces that the session is linked.
        self.deps.store.session_identity(session_id).await?;
        self.deps.store.get_job(job_id).await
    }

    /// Jobs initiated by the session's identity, newest first (≤ 50).
    pub async fn list_jobs(&self, session_id: &str, limit: i64) -> Result<Vec<IndexingJob>> {
        let identity = self.deps.store.session_identity(session_id).await?;
        self.deps.store.list_jobs_by_identity(&identity, limit).await
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Semantic search over an index the session can read.
    pub async fn search(
        &self,
        session_id: &str,
        index_name: &str,
        query_text: &str,
        k: i64,
    ) -> Result<Vec<SearchHit>> {
        let identity = self.deps.store.session_identity(session_id).await?;
        // An unparseable index name cannot exist; report it the same way as
        // a missing grant so nothing is leaked.
        let index = IndexName::parse(index_name)
            .map_err(|_| DocdexError::access_denied(index_name))?;

        query::search(
            &self.deps.store,
            &self.deps.embedder,
            &self.deps.limiter,
            &self.deps.retry,
            &identity,
            &index,
            query_text,
            k,
        )
        .await
    }

    /// The embedding configuration in effect.
    pub fn embedding_config(&self) -> EmbeddingInfo {
        EmbeddingInfo {
            provider: self.deps.embedder.provider().to_string(),
            model: self.deps.embedder.model().to_string(),
            dimensions: self.deps.embedder.dimensions(),
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Apply the retention windows: GC idle session links and prune old
    /// terminal jobs. Returns `(sessions_pruned, jobs_pruned)`.
    pub async fn prune(&self) -> Result<(u64, u64)> {
        let sessions = self
            .deps
            .store
            .prune_session_links(self.config.store.session_idle_days)
            .await?;
        let jobs = self
            .deps
            .store
            .prune_jobs(self.config.store.job_retention_days)
            .await?;
        Ok((sessions, jobs))
    }
}
