//! End-to-end ingest orchestration: URL → sitemap seeds → crawl → chunk →
//! rate-limited batch embed → per-index upsert, with durable job progress.
//!
//! The crawler runs as its own task and streams pages through a bounded
//! channel; the orchestrating task chunks, buffers, and flushes batches
//! through the limiter. The channel bound is the back-pressure point: a full
//! buffer blocks the crawler's sink until a flush drains into provider
//! throughput.

use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use url::Url;

use docdex_crawler::{CrawledPage, CrawlSummary, Crawler, canonicalize};
use docdex_discovery::DiscoveryOptions;
use docdex_embed::{
    EmbeddingClient, RateLimiter, RetryPolicy, estimate_batch_tokens,
};
use docdex_extract::{ChunkOptions, chunk_text};
use docdex_shared::{
    ChunkMetadata, CrawlConfig, DocKind, DocdexError, IndexName, JobProgress, JobStatus, Result,
};
use docdex_store::{ChunkRecord, DistributedRateLimiter, JobUpdate, Store};

use crate::pdf;

// ---------------------------------------------------------------------------
// Dependencies and options
// ---------------------------------------------------------------------------

/// Shared collaborators injected into every ingest run.
pub struct PipelineDeps {
    pub store: Store,
    pub embedder: Arc<EmbeddingClient>,
    pub limiter: Arc<RateLimiter>,
    /// Cross-process admission gate, composed in front of the local limiter
    /// when configured.
    pub distributed: Option<DistributedRateLimiter>,
    pub retry: RetryPolicy,
}

/// Per-run ingest options.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub crawl: CrawlConfig,
    pub chunking: ChunkOptions,
    /// Chunks per embedding call.
    pub batch_size: usize,
    /// Overall job deadline; reaching it stops enqueuing, drains in-flight
    /// work, and marks the job `timeout`.
    pub deadline: Option<Duration>,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a page has been chunked into the pending buffer.
    fn page_processed(&self, url: &str, processed: i64);
    /// Called after a flush with the cumulative chunk count.
    fn chunks_flushed(&self, total_chunks: i64);
}

/// No-op progress reporter for headless usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn page_processed(&self, _url: &str, _processed: i64) {}
    fn chunks_flushed(&self, _total_chunks: i64) {}
}

/// How the orchestration loop ended.
#[derive(Clone, Copy)]
enum LoopEnd {
    Drained,
    Deadline,
    Cancelled,
}

/// One chunk waiting for the next flush.
struct PendingChunk {
    page_url: String,
    title: String,
    content: String,
}

// ---------------------------------------------------------------------------
// HTML ingest
// ---------------------------------------------------------------------------

/// Run a full HTML ingest for `source_url` against the job row `job_id`.
///
/// The job is marked `running` on entry and ends in exactly one terminal
/// state: `completed`, `timeout`, `cancelled`, or `failed` (with message and
/// structured details). Chunk upserts are keyed by content hash, so
/// re-running the same job is idempotent.
#[instrument(skip_all, fields(job_id = %job_id, url = %source_url))]
pub async fn run_html_ingest(
    deps: &PipelineDeps,
    opts: &IngestOptions,
    source_url: &Url,
    job_id: &str,
    progress: &dyn ProgressReporter,
    cancel: watch::Receiver<bool>,
) -> Result<JobProgress> {
    deps.store
        .update_job(job_id, JobUpdate::status(JobStatus::Running))
        .await?;

    // The wrapper owns the counters so that partial progress survives onto
    // the job row even when the run fails mid-flight.
    let mut counters = JobProgress::default();

    match html_ingest_inner(deps, opts, source_url, job_id, progress, cancel, &mut counters).await
    {
        Ok(LoopEnd::Drained) => {
            finish(deps, job_id, JobStatus::Completed, counters, None).await?;
            progress.phase("Completed");
            Ok(counters)
        }
        Ok(LoopEnd::Deadline) => {
            finish(
                deps,
                job_id,
                JobStatus::Timeout,
                counters,
                Some("job deadline exceeded".into()),
            )
            .await?;
            progress.phase("Timed out");
            Ok(counters)
        }
        Ok(LoopEnd::Cancelled) => {
            finish(
                deps,
                job_id,
                JobStatus::Cancelled,
                counters,
                Some("cancelled by caller".into()),
            )
            .await?;
            progress.phase("Cancelled");
            Ok(counters)
        }
        Err(e) => {
            fail_job(deps, job_id, &e, counters).await;
            Err(e)
        }
    }
}

async fn html_ingest_inner(
    deps: &PipelineDeps,
    opts: &IngestOptions,
    source_url: &Url,
    job_id: &str,
    progress: &dyn ProgressReporter,
    cancel: watch::Receiver<bool>,
    counters: &mut JobProgress,
) -> Result<LoopEnd> {
    let index = IndexName::derive(source_url)?;
    deps.store
        .ensure_store(&index, deps.embedder.dimensions())
        .await?;

    progress.phase("Discovering sitemaps");
    let seeds = sitemap_seeds(source_url, &opts.crawl).await;

    progress.phase("Crawling documentation");
    let (crawl_task, mut page_rx) = spawn_crawl(opts, source_url.clone(), seeds)?;

    let mut pending: Vec<PendingChunk> = Vec::new();

    let deadline = async {
        match opts.deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut cancel = cancel;
    let cancelled = async move {
        loop {
            if *cancel.borrow() {
                return;
            }
            if cancel.changed().await.is_err() {
                // Caller dropped the handle without cancelling.
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::pin!(cancelled);

    let end = loop {
        tokio::select! {
            biased;
            _ = &mut cancelled => break LoopEnd::Cancelled,
            _ = &mut deadline => break LoopEnd::Deadline,
            page = page_rx.recv() => match page {
                Some(page) => {
                    buffer_page(page, opts, &mut pending, counters, progress);
                    while pending.len() >= opts.batch_size {
                        flush_one_batch(deps, opts, &index, &mut pending, counters, DocKind::Html, None)
                            .await?;
                        deps.store
                            .update_job(job_id, JobUpdate::progress(*counters))
                            .await?;
                        progress.chunks_flushed(counters.total_chunks);
                    }
                }
                None => break LoopEnd::Drained,
            },
        }
    };

    match end {
        LoopEnd::Drained => {
            let summary = crawl_task
                .await
                .map_err(|e| DocdexError::Network(format!("crawl task failed: {e}")))??;
            log_summary(&summary);
        }
        LoopEnd::Deadline | LoopEnd::Cancelled => {
            // Stop enqueuing; drain pages already fetched.
            crawl_task.abort();
            while let Ok(page) = page_rx.try_recv() {
                buffer_page(page, opts, &mut pending, counters, progress);
            }
        }
    }

    // Flush the residual buffer.
    while !pending.is_empty() {
        flush_one_batch(deps, opts, &index, &mut pending, counters, DocKind::Html, None).await?;
        progress.chunks_flushed(counters.total_chunks);
    }

    Ok(end)
}

/// Expand sitemap seeds for the crawl, constrained to the seed's host and
/// path prefix. Discovery failures are non-fatal.
async fn sitemap_seeds(source_url: &Url, crawl: &CrawlConfig) -> Vec<Url> {
    let discovery_opts = DiscoveryOptions {
        user_agent: crawl.user_agent.clone(),
        ..DiscoveryOptions::default()
    };

    let mut seeds = match docdex_discovery::discover(source_url, &discovery_opts).await {
        Ok(seeds) => seeds,
        Err(e) => {
            warn!(error = %e, "sitemap discovery failed, crawling from the seed only");
            return Vec::new();
        }
    };

    let prefix = canonicalize(source_url).path().to_string();
    if prefix != "/" {
        seeds.retain(|u| u.path().starts_with(&prefix));
    }
    seeds
}

/// Spawn the crawler task, returning its handle and the page channel.
///
/// The channel holds `2 × batch_size` pages, so the crawler blocks once the
/// pending work is roughly two flushes ahead of the embedder.
fn spawn_crawl(
    opts: &IngestOptions,
    seed: Url,
    seeds: Vec<Url>,
) -> Result<(JoinHandle<Result<CrawlSummary>>, mpsc::Receiver<CrawledPage>)> {
    let crawler = Crawler::new(opts.crawl.clone())?;
    let (page_tx, page_rx) = mpsc::channel::<CrawledPage>((2 * opts.batch_size).max(2));

    let task = tokio::spawn(async move {
        crawler
            .crawl(&seed, &seeds, move |page| {
                let tx = page_tx.clone();
                async move {
                    tx.send(page)
                        .await
                        .map_err(|_| DocdexError::Network("page channel closed".into()))
                }
            })
            .await
    });

    Ok((task, page_rx))
}

/// Chunk a delivered page into the pending buffer and bump counters.
///
/// Pages with empty extracted text are delivered by the crawler but counted
/// nowhere; a page counts as discovered/processed once non-empty text is
/// obtained, and as indexed once it contributes chunks.
fn buffer_page(
    page: CrawledPage,
    opts: &IngestOptions,
    pending: &mut Vec<PendingChunk>,
    counters: &mut JobProgress,
    progress: &dyn ProgressReporter,
) {
    if page.text.is_empty() {
        return;
    }
    counters.pages_discovered += 1;
    counters.pages_processed += 1;

    let chunks = chunk_text(&page.text, &opts.chunking);
    if chunks.is_empty() {
        return;
    }
    counters.pages_indexed += 1;

    let page_url = page.url.to_string();
    for content in chunks {
        pending.push(PendingChunk {
            page_url: page_url.clone(),
            title: page.title.clone(),
            content,
        });
    }

    progress.page_processed(&page_url, counters.pages_processed);
}

/// Embed and upsert one batch from the front of the pending buffer.
///
/// Admission order: distributed window first (when configured), then the
/// local limiter, then the provider call under retry. Upserts are issued in
/// buffer order and must all succeed before the chunks are counted.
async fn flush_one_batch(
    deps: &PipelineDeps,
    opts: &IngestOptions,
    index: &IndexName,
    pending: &mut Vec<PendingChunk>,
    counters: &mut JobProgress,
    kind: DocKind,
    page_count: Option<usize>,
) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }

    let take = opts.batch_size.max(1).min(pending.len());
    let batch: Vec<PendingChunk> = pending.drain(..take).collect();
    let contents: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();

    let tokens = estimate_batch_tokens(&contents);
    if let Some(distributed) = &deps.distributed {
        distributed.acquire(1, tokens).await?;
    }
    deps.limiter.acquire(1, tokens).await;

    let vectors = deps
        .retry
        .run(|| deps.embedder.embed_batch(&contents))
        .await?;

    for (chunk, embedding) in batch.iter().zip(vectors) {
        let metadata = ChunkMetadata {
            source: chunk.page_url.clone(),
            kind,
            title: chunk.title.clone(),
            size: chunk.content.len(),
            page_count,
        };
        let record = ChunkRecord {
            url: chunk_url(&chunk.page_url, &chunk.content),
            title: chunk.title.clone(),
            content: chunk.content.clone(),
            embedding,
            metadata: serde_json::to_value(&metadata)
                .map_err(|e| DocdexError::parse(format!("chunk metadata: {e}")))?,
        };
        deps.store.upsert_chunk(index, &record).await?;
        counters.total_chunks += 1;
    }

    Ok(())
}

/// Chunk row key: the page URL suffixed with the md5 of the chunk content,
/// so multiple chunks per page coexist and re-ingest overwrites in place.
fn chunk_url(page_url: &str, content: &str) -> String {
    let digest = Md5::digest(content.as_bytes());
    format!("{page_url}#{digest:x}")
}

// ---------------------------------------------------------------------------
// PDF ingest
// ---------------------------------------------------------------------------

/// Run a PDF ingest: fetch, extract, chunk, embed, upsert. The PDF counts
/// as a single page for the job counters.
#[instrument(skip_all, fields(job_id = %job_id, url = %pdf_url))]
pub async fn run_pdf_ingest(
    deps: &PipelineDeps,
    opts: &IngestOptions,
    pdf_url: &Url,
    job_id: &str,
    progress: &dyn ProgressReporter,
) -> Result<JobProgress> {
    deps.store
        .update_job(job_id, JobUpdate::status(JobStatus::Running))
        .await?;

    let mut counters = JobProgress::default();
    let inner = pdf_ingest_inner(deps, opts, pdf_url, job_id, progress, &mut counters);
    let outcome = match opts.deadline {
        Some(limit) => match tokio::time::timeout(limit, inner).await {
            Ok(result) => result.map(|()| LoopEnd::Drained),
            Err(_) => Ok(LoopEnd::Deadline),
        },
        None => inner.await.map(|()| LoopEnd::Drained),
    };

    match outcome {
        Ok(LoopEnd::Drained) => {
            finish(deps, job_id, JobStatus::Completed, counters, None).await?;
            progress.phase("Completed");
            Ok(counters)
        }
        Ok(_) => {
            finish(
                deps,
                job_id,
                JobStatus::Timeout,
                counters,
                Some("job deadline exceeded".into()),
            )
            .await?;
            progress.phase("Timed out");
            Ok(counters)
        }
        Err(e) => {
            fail_job(deps, job_id, &e, counters).await;
            Err(e)
        }
    }
}

async fn pdf_ingest_inner(
    deps: &PipelineDeps,
    opts: &IngestOptions,
    pdf_url: &Url,
    job_id: &str,
    progress: &dyn ProgressReporter,
    counters: &mut JobProgress,
) -> Result<()> {
    let index = IndexName::derive(pdf_url)?;
    deps.store
        .ensure_store(&index, deps.embedder.dimensions())
        .await?;

    progress.phase("Fetching PDF");
    let document = pdf::fetch_pdf(pdf_url, opts.crawl.timeout, &opts.crawl.user_agent).await?;

    counters.pages_discovered = 1;
    counters.pages_processed = 1;

    progress.phase("Chunking and embedding");
    let page_url = canonicalize(pdf_url).to_string();
    let chunks = chunk_text(&document.text, &opts.chunking);
    if !chunks.is_empty() {
        counters.pages_indexed = 1;
    }

    let mut pending: Vec<PendingChunk> = chunks
        .into_iter()
        .map(|content| PendingChunk {
            page_url: page_url.clone(),
            title: document.title.clone(),
            content,
        })
        .collect();

    while !pending.is_empty() {
        flush_one_batch(
            deps,
            opts,
            &index,
            &mut pending,
            counters,
            DocKind::Pdf,
            Some(document.page_count),
        )
        .await?;
        deps.store
            .update_job(job_id, JobUpdate::progress(*counters))
            .await?;
        progress.chunks_flushed(counters.total_chunks);
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Terminal transitions
// ---------------------------------------------------------------------------

async fn finish(
    deps: &PipelineDeps,
    job_id: &str,
    status: JobStatus,
    counters: JobProgress,
    error_message: Option<String>,
) -> Result<()> {
    let mut update = JobUpdate::status(status).with_progress(counters);
    if let Some(message) = error_message {
        update = update.with_error(message, None);
    }
    let applied = deps.store.update_job(job_id, update).await?;
    if !applied {
        // First terminal writer wins; a lost race is not an error here.
        warn!(job_id, status = %status, "job was already terminal, update ignored");
    }
    Ok(())
}

/// Mark the job failed, persisting the latest counters alongside the error
/// so partial progress stays visible as evidence.
async fn fail_job(deps: &PipelineDeps, job_id: &str, error: &DocdexError, counters: JobProgress) {
    let details = serde_json::json!({
        "kind": error.kind(),
        "message": error.to_string(),
    });
    let update = JobUpdate::status(JobStatus::Failed)
        .with_progress(counters)
        .with_error(error.to_string(), Some(details));
    if let Err(e) = deps.store.update_job(job_id, update).await {
        warn!(job_id, error = %e, "failed to record job failure");
    }
}

fn log_summary(summary: &CrawlSummary) {
    info!(
        pages_delivered = summary.pages_delivered,
        pages_skipped = summary.pages_skipped,
        urls_seen = summary.urls_seen,
        errors = summary.errors.len(),
        duration_ms = summary.duration.as_millis() as u64,
        "crawl finished"
    );
}
