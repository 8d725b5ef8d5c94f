//! docdex CLI — documentation ingestion and semantic search.
//!
//! Crawls documentation sites (or fetches PDFs) into per-index vector
//! tables and answers natural-language queries against them, gated by
//! session-linked access grants.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
