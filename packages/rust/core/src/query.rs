//! Access-gated semantic search over a per-index chunk table.

use tracing::{debug, instrument};

use docdex_embed::{EmbeddingClient, RateLimiter, RetryPolicy, estimate_tokens};
use docdex_shared::{AccessLevel, DocdexError, Identity, IndexName, Result, SearchHit};
use docdex_store::Store;

/// Search result snippets are truncated to this many characters.
const MAX_SNIPPET_CHARS: usize = 500;

/// Results are clamped to at most this many hits.
const MAX_RESULTS: i64 = 50;

/// Embed `query_text` and return the top-k nearest chunks of `index`.
///
/// Requires a `read` grant; a missing grant — or an index that does not
/// exist at all — yields [`DocdexError::AccessDenied`] so that index
/// existence is never leaked. `k` is clamped to `[1, 50]`.
#[instrument(skip_all, fields(index = %index, k))]
pub async fn search(
    store: &Store,
    embedder: &EmbeddingClient,
    limiter: &RateLimiter,
    retry: &RetryPolicy,
    identity: &Identity,
    index: &IndexName,
    query_text: &str,
    k: i64,
) -> Result<Vec<SearchHit>> {
    let k = k.clamp(1, MAX_RESULTS);

    if !store.has_access(identity, index, AccessLevel::Read).await? {
        return Err(DocdexError::access_denied(index.as_str()));
    }

    limiter.acquire(1, estimate_tokens(query_text)).await;
    let query = vec![query_text.to_string()];
    let mut vectors = retry.run(|| embedder.embed_batch(&query)).await?;
    let Some(vector) = vectors.pop() else {
        return Err(DocdexError::parse("provider returned no query vector"));
    };

    let hits = store.ann_search(index, &vector, k).await?;
    debug!(hits = hits.len(), "semantic search complete");

    Ok(hits
        .into_iter()
        .map(|hit| SearchHit {
            url: hit.url,
            title: hit.title,
            snippet: truncate_chars(&hit.content, MAX_SNIPPET_CHARS),
            score: hit.score,
        })
        .collect())
}

/// Truncate to at most `max` characters on a char boundary.
fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((byte_offset, _)) => s[..byte_offset].to_string(),
        None => s.to_string(),
    }
}
