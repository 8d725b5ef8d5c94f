//! Core orchestration for docdex: the ingest pipeline, PDF ingestion, the
//! scoped semantic-query path, and the operations facade consumed by
//! transports.

pub mod ops;
pub mod pdf;
pub mod pipeline;
pub mod query;

pub use ops::{Docdex, EmbeddingInfo};
pub use pipeline::{IngestOptions, PipelineDeps, ProgressReporter, SilentProgress};
