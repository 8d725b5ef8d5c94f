//! Provider-agnostic batch embedding client.
//!
//! Two wire styles are supported as a tagged enum: OpenAI-style (the caller
//! requests a dimension) and Gemini-style (the provider chooses; vectors are
//! L2-normalized client-side when needed). On a mismatch between the
//! declared and returned dimension, the client adopts the provider's actual
//! output dimension.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use docdex_shared::{DocdexError, EmbeddingConfig, Result};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Request timeout for embedding calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Vectors whose L2 norm deviates from 1 by more than this are normalized.
const NORM_TOLERANCE: f32 = 1e-3;

// ---------------------------------------------------------------------------
// EmbeddingClient
// ---------------------------------------------------------------------------

/// A batch embedder: one of the supported provider wire styles.
pub enum EmbeddingClient {
    OpenAiStyle(OpenAiEmbedder),
    GeminiStyle(GeminiEmbedder),
}

impl EmbeddingClient {
    /// Build a client from configuration and a resolved API key.
    pub fn from_config(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        match config.provider.as_str() {
            "openai" => Ok(Self::OpenAiStyle(OpenAiEmbedder::new(
                api_key,
                config.model.clone(),
                config.dimensions,
                config.base_url.clone(),
            )?)),
            "gemini" => Ok(Self::GeminiStyle(GeminiEmbedder::new(
                api_key,
                config.model.clone(),
                config.dimensions,
                config.base_url.clone(),
            )?)),
            other => Err(DocdexError::config(format!(
                "unknown embedding provider {other:?} (expected \"openai\" or \"gemini\")"
            ))),
        }
    }

    /// Embed a batch of texts, one vector per input, in input order.
    /// An empty batch returns an empty list without a network call.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Self::OpenAiStyle(inner) => inner.embed_batch(texts).await,
            Self::GeminiStyle(inner) => inner.embed_batch(texts).await,
        }
    }

    /// The currently declared vector dimension.
    pub fn dimensions(&self) -> usize {
        match self {
            Self::OpenAiStyle(inner) => inner.dimensions.load(Ordering::Relaxed),
            Self::GeminiStyle(inner) => inner.dimensions.load(Ordering::Relaxed),
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Self::OpenAiStyle(inner) => &inner.model,
            Self::GeminiStyle(inner) => &inner.model,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            Self::OpenAiStyle(_) => "openai",
            Self::GeminiStyle(_) => "gemini",
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI-style
// ---------------------------------------------------------------------------

/// OpenAI-style embedder: the request carries the wanted dimension.
pub struct OpenAiEmbedder {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: AtomicUsize,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: String,
        model: String,
        dimensions: usize,
        base_url: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            http: build_http()?,
            base_url: base_url.unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            api_key,
            model,
            dimensions: AtomicUsize::new(dimensions),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let request = OpenAiRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions.load(Ordering::Relaxed),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| DocdexError::Network(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(provider_error(&url, response).await);
        }

        let body: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| DocdexError::parse(format!("embedding response: {e}")))?;

        let vectors: Vec<Vec<f32>> = body.data.into_iter().map(|d| d.embedding).collect();
        check_batch_len(texts.len(), &vectors)?;
        adopt_dimension(&self.dimensions, &vectors, &self.model);

        Ok(vectors)
    }
}

// ---------------------------------------------------------------------------
// Gemini-style
// ---------------------------------------------------------------------------

/// Gemini-style embedder: the provider reports the actual dimension, and
/// vectors are normalized client-side when not already unit-length.
pub struct GeminiEmbedder {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: AtomicUsize,
}

#[derive(Serialize)]
struct GeminiBatchRequest {
    requests: Vec<GeminiEmbedRequest>,
}

#[derive(Serialize)]
struct GeminiEmbedRequest {
    model: String,
    content: GeminiContent,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiBatchResponse {
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

impl GeminiEmbedder {
    pub fn new(
        api_key: String,
        model: String,
        dimensions: usize,
        base_url: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            http: build_http()?,
            base_url: base_url.unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
            api_key,
            model,
            dimensions: AtomicUsize::new(dimensions),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!(
            "{}/models/{}:batchEmbedContents",
            self.base_url, self.model
        );
        let request = GeminiBatchRequest {
            requests: texts
                .iter()
                .map(|text| GeminiEmbedRequest {
                    model: format!("models/{}", self.model),
                    content: GeminiContent {
                        parts: vec![GeminiPart { text: text.clone() }],
                    },
                })
                .collect(),
        };

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| DocdexError::Network(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(provider_error(&url, response).await);
        }

        let body: GeminiBatchResponse = response
            .json()
            .await
            .map_err(|e| DocdexError::parse(format!("embedding response: {e}")))?;

        let mut vectors: Vec<Vec<f32>> = body.embeddings.into_iter().map(|e| e.values).collect();
        check_batch_len(texts.len(), &vectors)?;

        for vector in &mut vectors {
            l2_normalize(vector);
        }
        adopt_dimension(&self.dimensions, &vectors, &self.model);

        Ok(vectors)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_http() -> Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| DocdexError::Network(format!("failed to build HTTP client: {e}")))
}

fn check_batch_len(expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() == expected {
        Ok(())
    } else {
        Err(DocdexError::parse(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            expected
        )))
    }
}

/// Adopt the provider's actual output dimension when it differs from the
/// declared one.
fn adopt_dimension(declared: &AtomicUsize, vectors: &[Vec<f32>], model: &str) {
    let Some(actual) = vectors.first().map(Vec::len) else {
        return;
    };
    let previous = declared.swap(actual, Ordering::Relaxed);
    if previous != actual {
        warn!(
            model,
            declared = previous,
            actual,
            "provider dimension differs from configured; adopting actual"
        );
    }
}

/// Scale a vector to unit L2 norm unless it already is (or is zero).
fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 && (norm - 1.0).abs() > NORM_TOLERANCE {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Turn a non-success provider response into a `Provider` error with status
/// and parsed `Retry-After`.
async fn provider_error(url: &str, response: Response) -> DocdexError {
    let status = response.status().as_u16();
    let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        url.to_string()
    } else {
        format!("{url}: {}", body.chars().take(500).collect::<String>())
    };
    debug!(status, ?retry_after, "embedding provider error");
    DocdexError::Provider {
        status,
        retry_after,
        message,
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    let raw = value?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    (when.with_timezone(&Utc) - Utc::now()).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn openai_client(server: &MockServer, dimensions: usize) -> EmbeddingClient {
        EmbeddingClient::OpenAiStyle(
            OpenAiEmbedder::new(
                "sk-test".into(),
                "text-embedding-3-small".into(),
                dimensions,
                Some(server.uri()),
            )
            .unwrap(),
        )
    }

    fn gemini_client(server: &MockServer) -> EmbeddingClient {
        EmbeddingClient::GeminiStyle(
            GeminiEmbedder::new(
                "key-test".into(),
                "gemini-embedding-001".into(),
                3,
                Some(server.uri()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn l2_normalization() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.6, 0.8]);

        // Already unit-length: untouched.
        let mut unit = vec![1.0, 0.0];
        l2_normalize(&mut unit);
        assert_eq!(unit, vec![1.0, 0.0]);

        // Zero vector: untouched, no NaNs.
        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn retry_after_parsing() {
        let header = HeaderValue::from_static("7");
        assert_eq!(
            parse_retry_after(Some(&header)),
            Some(Duration::from_secs(7))
        );

        let future = (Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let header = HeaderValue::from_str(&future).unwrap();
        let parsed = parse_retry_after(Some(&header)).unwrap();
        assert!(parsed <= Duration::from_secs(90));
        assert!(parsed >= Duration::from_secs(85));

        // A date in the past yields no wait.
        let past = (Utc::now() - chrono::Duration::seconds(90)).to_rfc2822();
        let header = HeaderValue::from_str(&past).unwrap();
        assert_eq!(parse_retry_after(Some(&header)), None);

        assert_eq!(parse_retry_after(None), None);
    }

    #[tokio::test]
    async fn openai_embed_batch_returns_vectors_in_order() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(serde_json::json!({
                "model": "text-embedding-3-small",
                "dimensions": 3,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    { "index": 0, "embedding": [1.0, 0.0, 0.0] },
                    { "index": 1, "embedding": [0.0, 1.0, 0.0] },
                ],
                "model": "text-embedding-3-small",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = openai_client(&server, 3);
        let vectors = client
            .embed_batch(&["first".into(), "second".into()])
            .await
            .unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0, 0.0]);
        assert_eq!(client.dimensions(), 3);
    }

    #[tokio::test]
    async fn empty_batch_skips_the_network() {
        let server = MockServer::start().await;
        // No mocks mounted: any request would 404 and fail the call.
        let client = openai_client(&server, 3);
        let vectors = client.embed_batch(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn adopts_provider_dimension_on_mismatch() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [ { "index": 0, "embedding": [0.1, 0.2] } ],
            })))
            .mount(&server)
            .await;

        let client = openai_client(&server, 1536);
        client.embed_batch(&["text".into()]).await.unwrap();
        assert_eq!(client.dimensions(), 2);
    }

    #[tokio::test]
    async fn rate_limit_error_carries_status_and_retry_after() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "12")
                    .set_body_string("rate limited"),
            )
            .mount(&server)
            .await;

        let client = openai_client(&server, 3);
        let err = client.embed_batch(&["text".into()]).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        match err {
            DocdexError::Provider { status, .. } => assert_eq!(status, 429),
            other => panic!("expected Provider error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn gemini_normalizes_unnormalized_vectors() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(
                "/models/gemini-embedding-001:batchEmbedContents",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [ { "values": [3.0, 4.0] } ],
            })))
            .mount(&server)
            .await;

        let client = gemini_client(&server);
        let vectors = client.embed_batch(&["text".into()]).await.unwrap();

        assert_eq!(vectors[0], vec![0.6, 0.8]);
        assert_eq!(client.dimensions(), 2);
    }

    #[tokio::test]
    async fn vector_count_mismatch_is_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [ { "index": 0, "embedding": [0.1] } ],
            })))
            .mount(&server)
            .await;

        let client = openai_client(&server, 1);
        let err = client
            .embed_batch(&["one".into(), "two".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 vectors for 2 inputs"));
    }
}
