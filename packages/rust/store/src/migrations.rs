//! SQL migration definitions for the docdex database.
//!
//! Migrations are applied in order at connect time. Per-index chunk tables
//! (`docs_<name>`) are not migrated here; they are created and recreated
//! dynamically by `ensure_store` because their vector dimension follows the
//! configured embedder.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: user_links, doc_access, indexing_jobs, rate window",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- Vector extension for the per-index docs_* tables
CREATE EXTENSION IF NOT EXISTS vector;

-- Session → identity links
CREATE TABLE IF NOT EXISTS user_links (
    session_id   TEXT PRIMARY KEY,
    user_id      TEXT,
    team_id      TEXT,
    scope        TEXT NOT NULL,
    linked_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_used_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_user_links_last_used ON user_links(last_used_at);

-- Per-(identity, index) access grants; NULL/NULL identity is universal
CREATE TABLE IF NOT EXISTS doc_access (
    id           BIGSERIAL PRIMARY KEY,
    user_id      TEXT,
    team_id      TEXT,
    scope        TEXT NOT NULL,
    index_name   TEXT NOT NULL,
    access_level TEXT NOT NULL,
    granted_by   TEXT NOT NULL,
    granted_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    expires_at   TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_doc_access_grant
    ON doc_access (COALESCE(user_id, ''), COALESCE(team_id, ''), scope, index_name);
CREATE INDEX IF NOT EXISTS idx_doc_access_index ON doc_access(index_name);

-- Durable indexing jobs
CREATE TABLE IF NOT EXISTS indexing_jobs (
    job_id            TEXT PRIMARY KEY,
    index_name        TEXT NOT NULL,
    source_url        TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'started',
    scope             TEXT NOT NULL,
    initiated_by_user TEXT,
    initiated_by_team TEXT,
    started_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    completed_at      TIMESTAMPTZ,
    duration_seconds  BIGINT,
    pages_discovered  BIGINT NOT NULL DEFAULT 0,
    pages_processed   BIGINT NOT NULL DEFAULT 0,
    pages_indexed     BIGINT NOT NULL DEFAULT 0,
    total_chunks      BIGINT NOT NULL DEFAULT 0,
    error_message     TEXT,
    error_details     JSONB,
    metadata          JSONB
);

CREATE INDEX IF NOT EXISTS idx_indexing_jobs_user
    ON indexing_jobs(initiated_by_user, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_indexing_jobs_team
    ON indexing_jobs(initiated_by_team, started_at DESC);

-- Singleton counter row for cross-process embed rate limiting
CREATE TABLE IF NOT EXISTS docs_embed_rate_window (
    id              SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
    minute_start    TIMESTAMPTZ NOT NULL DEFAULT now(),
    minute_requests BIGINT NOT NULL DEFAULT 0,
    minute_tokens   BIGINT NOT NULL DEFAULT 0,
    day_start       TIMESTAMPTZ NOT NULL DEFAULT now(),
    day_tokens      BIGINT NOT NULL DEFAULT 0
);

INSERT INTO docs_embed_rate_window (id) VALUES (1) ON CONFLICT (id) DO NOTHING;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
