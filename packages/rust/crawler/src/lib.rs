//! Same-host documentation crawler: URL canonicalization and a bounded,
//! concurrent BFS engine that streams extracted pages to a sink.

pub mod canonical;
mod engine;

pub use canonical::{canonicalize, is_asset_url};
pub use engine::{CrawledPage, CrawlSummary, Crawler};
