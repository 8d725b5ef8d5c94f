//! Core domain types for docdex indexes, jobs, and access control.

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DocdexError, Result};

// ---------------------------------------------------------------------------
// IndexName
// ---------------------------------------------------------------------------

/// A validated index name, derived deterministically from a source URL.
///
/// Contains only `[a-z0-9-]`, so it is always safe to embed in a (quoted)
/// table identifier. The chunk table for an index is `docs_<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexName(String);

impl IndexName {
    /// Derive the index name for a source URL.
    ///
    /// Lowercased host with a leading `www.` removed, non-alphanumerics
    /// collapsed to `-`; if the URL path ends in a filename with an
    /// extension, the sanitized filename stem is appended.
    pub fn derive(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| DocdexError::validation(format!("URL has no host: {url}")))?;
        let host = host.to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);

        let mut name = slugify(host);
        if name.is_empty() {
            return Err(DocdexError::validation(format!(
                "URL host yields an empty index name: {url}"
            )));
        }

        if let Some(stem) = filename_stem(url) {
            let stem = slugify(&stem);
            if !stem.is_empty() {
                name.push('-');
                name.push_str(&stem);
            }
        }

        Ok(Self(name))
    }

    /// Parse a caller-supplied index name. Derivation only produces
    /// `[a-z0-9-]`, but hand-assigned names may also use underscores.
    pub fn parse(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && !s.starts_with('-')
            && !s.ends_with('-')
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(DocdexError::validation(format!("invalid index name: {s:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unquoted chunk-table name for this index.
    pub fn table(&self) -> String {
        format!("docs_{}", self.0)
    }
}

impl std::fmt::Display for IndexName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapse a string to `[a-z0-9]` runs joined by single `-`.
fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// The percent-decoded filename stem of the URL path, if the final segment
/// looks like a file (has a non-empty extension).
fn filename_stem(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    if segment.is_empty() {
        return None;
    }
    let decoded = percent_decode_str(segment).decode_utf8_lossy();
    let (stem, ext) = decoded.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(stem.to_string())
}

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

/// Lifecycle states of an indexing job. Transitions are monotonic; the four
/// terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Started,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatus {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DocdexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(Self::Started),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DocdexError::validation(format!(
                "unknown job status: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Scope and access level
// ---------------------------------------------------------------------------

/// Whether an identity or grant refers to a user or a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    Team,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Team => "team",
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = DocdexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "team" => Ok(Self::Team),
            other => Err(DocdexError::validation(format!("unknown scope: {other:?}"))),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grant levels, ordered `Read < Write < Admin` so a required level can be
/// checked with `>=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }
}

impl std::str::FromStr for AccessLevel {
    type Err = DocdexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "admin" => Ok(Self::Admin),
            other => Err(DocdexError::validation(format!(
                "unknown access level: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// An opaque caller identity, supplied by the transport layer.
///
/// User-scope identities carry a `user_id`; team-scope identities carry a
/// `team_id` and may additionally carry the linking user's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub scope: Scope,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
}

impl Identity {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            scope: Scope::User,
            user_id: Some(user_id.into()),
            team_id: None,
        }
    }

    pub fn team(team_id: impl Into<String>) -> Self {
        Self {
            scope: Scope::Team,
            user_id: None,
            team_id: Some(team_id.into()),
        }
    }

    pub fn team_with_user(team_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            scope: Scope::Team,
            user_id: Some(user_id.into()),
            team_id: Some(team_id.into()),
        }
    }

    /// The identifier selected by the scope.
    pub fn subject_id(&self) -> Option<&str> {
        match self.scope {
            Scope::User => self.user_id.as_deref(),
            Scope::Team => self.team_id.as_deref(),
        }
    }

    /// Validate that the scope-selected identifier is present.
    pub fn validate(&self) -> Result<()> {
        if self.subject_id().is_some_and(|id| !id.is_empty()) {
            Ok(())
        } else {
            Err(DocdexError::validation(format!(
                "identity is missing its {} identifier",
                self.scope
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Monotonic progress counters for an indexing job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub pages_discovered: i64,
    pub pages_processed: i64,
    pub pages_indexed: i64,
    pub total_chunks: i64,
}

/// A durable indexing-job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingJob {
    /// Job identifier supplied by the orchestrator (maps to the external
    /// workflow id).
    pub job_id: String,
    pub index_name: String,
    pub source_url: String,
    pub status: JobStatus,
    pub scope: Scope,
    pub initiated_by_user: Option<String>,
    pub initiated_by_team: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    #[serde(flatten)]
    pub progress: JobProgress,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

impl IndexingJob {
    /// The identity that initiated this job.
    pub fn identity(&self) -> Identity {
        Identity {
            scope: self.scope,
            user_id: self.initiated_by_user.clone(),
            team_id: self.initiated_by_team.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Chunks and search results
// ---------------------------------------------------------------------------

/// Source kind of an ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
    Html,
    Pdf,
}

/// Metadata stored alongside each chunk row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// The source URL the chunk was extracted from.
    pub source: String,
    #[serde(rename = "type")]
    pub kind: DocKind,
    pub title: String,
    /// Chunk length in characters.
    pub size: usize,
    #[serde(rename = "pageCount", skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
}

/// One semantic-search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    /// Chunk content truncated to at most 500 characters.
    pub snippet: String,
    /// `1 − cosine distance`; higher is closer.
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derive(url: &str) -> String {
        IndexName::derive(&Url::parse(url).unwrap())
            .unwrap()
            .to_string()
    }

    #[test]
    fn index_name_from_docs_site() {
        assert_eq!(
            derive("https://www.example.com/docs/getting-started/intro"),
            "example-com"
        );
    }

    #[test]
    fn index_name_lowercases_multi_label_hosts() {
        assert_eq!(
            derive("http://www.Example-Sub.Domain.co.uk/path"),
            "example-sub-domain-co-uk"
        );
    }

    #[test]
    fn index_name_appends_pdf_stem() {
        assert_eq!(
            derive("https://hmd-wp.go-vip.net/wp-content/uploads/2025/05/2025-US-FDD-Embassy-Suites-v.2.pdf"),
            "hmd-wp-go-vip-net-2025-us-fdd-embassy-suites-v-2"
        );
    }

    #[test]
    fn index_name_decodes_and_sanitizes_filenames() {
        assert_eq!(
            derive("https://files.example.com/docs/My Report 2024 FINAL.PDF"),
            "files-example-com-my-report-2024-final"
        );
    }

    #[test]
    fn index_name_ignores_query_and_fragment() {
        assert_eq!(
            derive("https://example.com/guide/intro?utm_source=foo#section-1"),
            "example-com"
        );
    }

    #[test]
    fn index_name_table_and_parse() {
        let name = IndexName::parse("example-com").unwrap();
        assert_eq!(name.table(), "docs_example-com");

        assert!(IndexName::parse("docs_foo").is_ok());
        assert!(IndexName::parse("").is_err());
        assert!(IndexName::parse("Has-Caps").is_err());
        assert!(IndexName::parse("-leading").is_err());
        assert!(IndexName::parse("semi;colon").is_err());
    }

    #[test]
    fn job_status_terminal_set() {
        assert!(!JobStatus::Started.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        for s in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Timeout,
            JobStatus::Cancelled,
        ] {
            assert!(s.is_terminal());
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
    }

    #[test]
    fn access_level_ordering() {
        assert!(AccessLevel::Admin > AccessLevel::Write);
        assert!(AccessLevel::Write > AccessLevel::Read);
        assert!(AccessLevel::Admin >= AccessLevel::Read);
    }

    #[test]
    fn identity_subject_selection() {
        let user = Identity::user("u1");
        assert_eq!(user.subject_id(), Some("u1"));
        user.validate().unwrap();

        let team = Identity::team_with_user("t1", "u1");
        assert_eq!(team.subject_id(), Some("t1"));
        team.validate().unwrap();

        let broken = Identity {
            scope: Scope::Team,
            user_id: Some("u1".into()),
            team_id: None,
        };
        assert!(broken.validate().is_err());
    }

    #[test]
    fn chunk_metadata_wire_format() {
        let meta = ChunkMetadata {
            source: "https://example.com/doc.pdf".into(),
            kind: DocKind::Pdf,
            title: "Doc".into(),
            size: 1200,
            page_count: Some(7),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "pdf");
        assert_eq!(json["pageCount"], 7);

        let html = ChunkMetadata {
            source: "https://example.com/".into(),
            kind: DocKind::Html,
            title: "Home".into(),
            size: 10,
            page_count: None,
        };
        let json = serde_json::to_value(&html).unwrap();
        assert_eq!(json["type"], "html");
        assert!(json.get("pageCount").is_none());
    }
}
