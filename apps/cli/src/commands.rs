//! CLI command definitions, routing, and tracing setup.

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::info;
use url::Url;

use docdex_core::{Docdex, ProgressReporter};
use docdex_shared::{AccessLevel, Identity, IndexName, load_config};
use docdex_store::AccessGrant;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// docdex — crawl documentation into a vector store and search it.
#[derive(Parser)]
#[command(
    name = "docdex",
    version,
    about = "Ingest documentation sites and PDFs into per-index vector tables and search them.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Crawl a documentation site into its index.
    Ingest {
        /// Documentation URL to ingest.
        url: String,

        /// Session id acting as the caller identity.
        #[arg(short, long)]
        session: String,
    },

    /// Fetch a single PDF into its index.
    IngestPdf {
        /// PDF URL to ingest.
        url: String,

        /// Session id acting as the caller identity.
        #[arg(short, long)]
        session: String,
    },

    /// Semantic search over an accessible index.
    Search {
        /// Index name (as listed by `docdex indexes`).
        index: String,

        /// Natural-language query.
        query: String,

        /// Session id acting as the caller identity.
        #[arg(short, long)]
        session: String,

        /// Number of results (clamped to 50).
        #[arg(short = 'k', long, default_value = "5")]
        top_k: i64,
    },

    /// Link a session id to a user or team identity.
    Link {
        /// Session id to link.
        session: String,

        /// User id (user scope; combined with --team for team scope).
        #[arg(long)]
        user: Option<String>,

        /// Team id (team scope).
        #[arg(long)]
        team: Option<String>,
    },

    /// Grant an identity access to an index.
    Grant {
        /// Index name to grant on.
        index: String,

        /// Access level: read, write, or admin.
        #[arg(long, default_value = "read")]
        level: String,

        /// Target user id.
        #[arg(long)]
        user: Option<String>,

        /// Target team id.
        #[arg(long)]
        team: Option<String>,

        /// Grant to everyone.
        #[arg(long, conflicts_with_all = ["user", "team"])]
        universal: bool,

        /// Expiry in days from now (no expiry if omitted).
        #[arg(long)]
        expires_days: Option<i64>,
    },

    /// List the indexes the session can access.
    Indexes {
        /// Session id acting as the caller identity.
        #[arg(short, long)]
        session: String,
    },

    /// Indexing job inspection.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Show the embedding provider configuration in effect.
    Embedding,

    /// Garbage-collect idle session links and old terminal jobs.
    Prune,

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Job subcommands.
#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List recent jobs for the session's identity.
    List {
        /// Session id acting as the caller identity.
        #[arg(short, long)]
        session: String,

        /// Maximum rows (clamped to 50).
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Show one job's status, counters, and failure details.
    Status {
        /// Job id.
        job_id: String,

        /// Session id acting as the caller identity.
        #[arg(short, long)]
        session: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "docdex=info",
        1 => "docdex=debug",
        _ => "docdex=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Ingest { url, session } => cmd_ingest(&url, &session, false).await,
        Command::IngestPdf { url, session } => cmd_ingest(&url, &session, true).await,
        Command::Search {
            index,
            query,
            session,
            top_k,
        } => cmd_search(&index, &query, &session, top_k).await,
        Command::Link {
            session,
            user,
            team,
        } => cmd_link(&session, user, team).await,
        Command::Grant {
            index,
            level,
            user,
            team,
            universal,
            expires_days,
        } => cmd_grant(&index, &level, user, team, universal, expires_days).await,
        Command::Indexes { session } => cmd_indexes(&session).await,
        Command::Jobs { action } => match action {
            JobsAction::List { session, limit } => cmd_jobs_list(&session, limit).await,
            JobsAction::Status { job_id, session } => cmd_job_status(&job_id, &session).await,
        },
        Command::Embedding => cmd_embedding().await,
        Command::Prune => cmd_prune().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

/// Connect the service with the resolved configuration.
async fn connect() -> Result<Docdex> {
    let config = load_config()?;
    Ok(Docdex::connect(config).await?)
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Spinner-backed progress reporter for ingest runs.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}").expect("valid progress template"),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn page_processed(&self, url: &str, processed: i64) {
        self.bar.set_message(format!("[{processed}] {url}"));
    }

    fn chunks_flushed(&self, total_chunks: i64) {
        self.bar.set_message(format!("{total_chunks} chunks indexed"));
    }
}

async fn cmd_ingest(url: &str, session: &str, pdf: bool) -> Result<()> {
    let source_url = Url::parse(url).map_err(|e| eyre!("invalid URL '{url}': {e}"))?;
    let docdex = connect().await?;

    let job_id = if pdf {
        docdex.start_pdf_ingest(session, &source_url).await?
    } else {
        docdex.start_html_ingest(session, &source_url).await?
    };
    info!(%job_id, "job created");

    let progress = CliProgress::new();
    let result = if pdf {
        docdex.run_pdf_ingest(&job_id, &source_url, &progress).await
    } else {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        docdex
            .run_html_ingest(&job_id, &source_url, &progress, cancel_rx)
            .await
    };
    progress.bar.finish_and_clear();

    match result {
        Ok(counters) => {
            println!("job {job_id} completed");
            println!(
                "  pages: {} discovered, {} processed, {} indexed",
                counters.pages_discovered, counters.pages_processed, counters.pages_indexed
            );
            println!("  chunks: {}", counters.total_chunks);
            Ok(())
        }
        Err(e) => {
            eprintln!("job {job_id} failed: {e}");
            eprintln!("inspect it with: docdex jobs status {job_id} --session <session>");
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Search and access
// ---------------------------------------------------------------------------

async fn cmd_search(index: &str, query: &str, session: &str, top_k: i64) -> Result<()> {
    let docdex = connect().await?;
    let hits = docdex.search(session, index, query, top_k).await?;

    if hits.is_empty() {
        println!("no results");
        return Ok(());
    }

    for (rank, hit) in hits.iter().enumerate() {
        println!("{}. {} (score {:.3})", rank + 1, hit.title, hit.score);
        println!("   {}", hit.url);
        println!("   {}", hit.snippet);
    }
    Ok(())
}

async fn cmd_link(session: &str, user: Option<String>, team: Option<String>) -> Result<()> {
    let identity = identity_from_flags(user, team)?;
    let docdex = connect().await?;
    docdex.link(session, &identity).await?;
    println!(
        "linked session {session} to {} {}",
        identity.scope,
        identity.subject_id().unwrap_or_default()
    );
    Ok(())
}

async fn cmd_grant(
    index: &str,
    level: &str,
    user: Option<String>,
    team: Option<String>,
    universal: bool,
    expires_days: Option<i64>,
) -> Result<()> {
    let index = IndexName::parse(index)?;
    let level: AccessLevel = level.parse()?;

    let mut grant = if universal {
        AccessGrant::universal(index.clone(), level, "cli")
    } else {
        let identity = identity_from_flags(user, team)?;
        AccessGrant::for_identity(&identity, index.clone(), level, "cli")
    };
    if let Some(days) = expires_days {
        grant = grant.expiring_at(chrono::Utc::now() + chrono::Duration::days(days));
    }

    let docdex = connect().await?;
    docdex.grant(&grant).await?;
    println!("granted {level} on {index}");
    Ok(())
}

async fn cmd_indexes(session: &str) -> Result<()> {
    let docdex = connect().await?;
    let indexes = docdex.list_accessible_indexes(session).await?;
    if indexes.is_empty() {
        println!("no accessible indexes");
    }
    for index in indexes {
        println!("{index}");
    }
    Ok(())
}

fn identity_from_flags(user: Option<String>, team: Option<String>) -> Result<Identity> {
    match (user, team) {
        (Some(user), None) => Ok(Identity::user(user)),
        (None, Some(team)) => Ok(Identity::team(team)),
        (Some(user), Some(team)) => Ok(Identity::team_with_user(team, user)),
        (None, None) => Err(eyre!("pass --user <id> or --team <id>")),
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

async fn cmd_jobs_list(session: &str, limit: i64) -> Result<()> {
    let docdex = connect().await?;
    let jobs = docdex.list_jobs(session, limit).await?;

    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<10} {}  ({} chunks)",
            job.job_id, job.status, job.source_url, job.progress.total_chunks
        );
    }
    Ok(())
}

async fn cmd_job_status(job_id: &str, session: &str) -> Result<()> {
    let docdex = connect().await?;
    match docdex.job_status(session, job_id).await? {
        Some(job) => {
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        None => Err(eyre!("no job with id {job_id}")),
    }
}

// ---------------------------------------------------------------------------
// Service info and maintenance
// ---------------------------------------------------------------------------

async fn cmd_embedding() -> Result<()> {
    let docdex = connect().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&docdex.embedding_config())?
    );
    Ok(())
}

async fn cmd_prune() -> Result<()> {
    let docdex = connect().await?;
    let (sessions, jobs) = docdex.prune().await?;
    println!("pruned {sessions} idle session links, {jobs} old jobs");
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = docdex_shared::init_config()?;
    println!("wrote {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    println!("{}", toml::to_string_pretty(&config).map_err(|e| eyre!(e))?);
    Ok(())
}
