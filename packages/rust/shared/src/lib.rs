//! Shared types, error model, and configuration for docdex.
//!
//! This crate is the foundation depended on by all other docdex crates.
//! It provides:
//! - [`DocdexError`] — the unified error type
//! - Domain types ([`IndexName`], [`JobStatus`], [`Identity`], [`JobProgress`])
//! - Configuration ([`AppConfig`], [`CrawlConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlConfig, CrawlDefaults, EmbeddingConfig, StoreConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{DocdexError, Result};
pub use types::{
    AccessLevel, ChunkMetadata, DocKind, Identity, IndexName, IndexingJob, JobProgress, JobStatus,
    Scope, SearchHit,
};
