//! Application configuration for docdex.
//!
//! User config lives at `~/.docdex/docdex.toml`. Environment variables
//! override config file values, which override defaults. Secrets (provider
//! key, database DSN) are only ever read from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DocdexError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "docdex.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".docdex";

// ---------------------------------------------------------------------------
// Config structs (matching docdex.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Crawl defaults.
    #[serde(default)]
    pub crawl: CrawlDefaults,

    /// Embedding provider and rate-limit settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector store settings.
    #[serde(default)]
    pub store: StoreConfig,
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlDefaults {
    /// Maximum pages delivered per crawl.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Crawler worker count; 0 selects an automatic value.
    #[serde(default)]
    pub concurrency: usize,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// User-Agent header for crawl requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// URL include regexes (if non-empty, a URL must match at least one).
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// URL exclude regexes (a matching URL is never enqueued).
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl Default for CrawlDefaults {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            concurrency: 0,
            timeout_ms: default_timeout_ms(),
            user_agent: default_user_agent(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }
}

fn default_max_pages() -> usize {
    10_000
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_user_agent() -> String {
    concat!("Docdex/", env!("CARGO_PKG_VERSION")).into()
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider kind: "openai" or "gemini".
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Embedding model id.
    #[serde(default = "default_model")]
    pub model: String,

    /// Requested vector dimension (providers may report a different one).
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Override for the provider base URL (tests, proxies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Chunks per embedding call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Requests-per-minute window quota.
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u64,

    /// Tokens-per-minute window quota.
    #[serde(default = "default_tpm")]
    pub tokens_per_minute: u64,

    /// Tokens-per-day window quota.
    #[serde(default = "default_tpd")]
    pub tokens_per_day: u64,

    /// Retry attempts for 429/5xx provider responses.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff in milliseconds (doubled per attempt).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Coordinate window admission across processes via the database.
    #[serde(default)]
    pub distributed: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            dimensions: default_dimensions(),
            base_url: None,
            batch_size: default_batch_size(),
            requests_per_minute: default_rpm(),
            tokens_per_minute: default_tpm(),
            tokens_per_day: default_tpd(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            distributed: false,
        }
    }
}

fn default_provider() -> String {
    "openai".into()
}
fn default_api_key_env() -> String {
    "EMBEDDING_API_KEY".into()
}
fn default_model() -> String {
    "text-embedding-3-small".into()
}
fn default_dimensions() -> usize {
    1536
}
fn default_batch_size() -> usize {
    32
}
fn default_rpm() -> u64 {
    3_000
}
fn default_tpm() -> u64 {
    1_000_000
}
fn default_tpd() -> u64 {
    50_000_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Name of the env var holding the Postgres DSN.
    #[serde(default = "default_database_url_env")]
    pub database_url_env: String,

    /// Session links idle longer than this are garbage-collected.
    #[serde(default = "default_session_idle_days")]
    pub session_idle_days: u32,

    /// Terminal jobs older than this may be pruned.
    #[serde(default = "default_job_retention_days")]
    pub job_retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url_env: default_database_url_env(),
            session_idle_days: default_session_idle_days(),
            job_retention_days: default_job_retention_days(),
        }
    }
}

fn default_database_url_env() -> String {
    "DATABASE_URL".into()
}
fn default_session_idle_days() -> u32 {
    30
}
fn default_job_retention_days() -> u32 {
    90
}

// ---------------------------------------------------------------------------
// Runtime crawl config (merged from config + env)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration handed to the crawler.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub max_pages: usize,
    pub concurrency: usize,
    pub timeout: Duration,
    pub user_agent: String,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Permit crawling loopback/private hosts (local mock servers only).
    pub allow_private_hosts: bool,
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        let c = &config.crawl;
        Self {
            max_pages: c.max_pages,
            concurrency: effective_concurrency(c.concurrency),
            timeout: Duration::from_millis(c.timeout_ms),
            user_agent: c.user_agent.clone(),
            include_patterns: c.include_patterns.clone(),
            exclude_patterns: c.exclude_patterns.clone(),
            allow_private_hosts: false,
        }
    }
}

/// Resolve the worker count: a configured non-zero value wins, otherwise
/// `min(16, max(4, available parallelism))` with 8 when parallelism is
/// unknown.
pub fn effective_concurrency(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8);
    cpus.clamp(4, 16)
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.docdex/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DocdexError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.docdex/docdex.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config: file (if present), then environment
/// overrides.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    let mut config = if path.exists() {
        load_config_from(&path)?
    } else {
        tracing::debug!(?path, "config file not found, using defaults");
        AppConfig::default()
    };

    config.apply_env_overrides();
    Ok(config)
}

/// Load the application config from a specific file path (no env overrides).
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DocdexError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DocdexError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DocdexError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DocdexError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DocdexError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

impl AppConfig {
    /// Apply `DOCS_*` / `EMBEDDING_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) {
        env_parse("DOCS_MAX_PAGES", &mut self.crawl.max_pages);
        env_parse("DOCS_CONCURRENCY", &mut self.crawl.concurrency);
        env_parse("DOCS_TIMEOUT_MS", &mut self.crawl.timeout_ms);
        env_string("DOCS_USER_AGENT", &mut self.crawl.user_agent);
        env_patterns("DOCS_INCLUDE_REGEX", &mut self.crawl.include_patterns);
        env_patterns("DOCS_EXCLUDE_REGEX", &mut self.crawl.exclude_patterns);

        env_parse("DOCS_EMBED_BATCH_SIZE", &mut self.embedding.batch_size);
        env_parse("DOCS_EMBED_RPM", &mut self.embedding.requests_per_minute);
        env_parse("DOCS_EMBED_TPM", &mut self.embedding.tokens_per_minute);
        env_parse("DOCS_EMBED_TPD", &mut self.embedding.tokens_per_day);
        env_parse("DOCS_EMBED_MAX_RETRIES", &mut self.embedding.max_retries);
        env_parse(
            "DOCS_EMBED_INITIAL_BACKOFF_MS",
            &mut self.embedding.initial_backoff_ms,
        );
        if let Ok(v) = std::env::var("DOCS_EMBED_DISTRIBUTED") {
            self.embedding.distributed = v == "1" || v.eq_ignore_ascii_case("true");
        }

        env_string("EMBEDDING_PROVIDER", &mut self.embedding.provider);
        env_string("EMBEDDING_MODEL", &mut self.embedding.model);
        env_parse("EMBEDDING_DIMENSIONS", &mut self.embedding.dimensions);
        if let Ok(v) = std::env::var("EMBEDDING_BASE_URL") {
            if !v.is_empty() {
                self.embedding.base_url = Some(v);
            }
        }
    }

    /// Resolve the Postgres DSN, failing fast when unset.
    pub fn database_url(&self) -> Result<String> {
        let var_name = &self.store.database_url_env;
        match std::env::var(var_name) {
            Ok(val) if !val.is_empty() => Ok(val),
            _ => Err(DocdexError::config(format!(
                "vector store DSN not found; set the {var_name} environment variable"
            ))),
        }
    }

    /// Resolve the embedding provider key, failing fast when unset.
    pub fn embedding_api_key(&self) -> Result<String> {
        let var_name = &self.embedding.api_key_env;
        match std::env::var(var_name) {
            Ok(val) if !val.is_empty() => Ok(val),
            _ => Err(DocdexError::config(format!(
                "embedding API key not found; set the {var_name} environment variable"
            ))),
        }
    }
}

fn env_string(name: &str, target: &mut String) {
    if let Ok(v) = std::env::var(name) {
        if !v.is_empty() {
            *target = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        } else {
            tracing::warn!(var = name, value = %v, "ignoring unparseable env override");
        }
    }
}

fn env_patterns(name: &str, target: &mut Vec<String>) {
    if let Ok(v) = std::env::var(name) {
        if !v.is_empty() {
            *target = v.split(',').map(|s| s.trim().to_string()).collect();
        }
    }
}
