//! Embedding pipeline plumbing: windowed rate limiting, retry with backoff,
//! and provider-agnostic batch embedding clients.

pub mod client;
pub mod limiter;
pub mod retry;

pub use client::{EmbeddingClient, GeminiEmbedder, OpenAiEmbedder};
pub use limiter::{LimiterConfig, RateLimiter, estimate_batch_tokens, estimate_tokens};
pub use retry::RetryPolicy;
