//! Error types for docdex.
//!
//! Library crates use [`DocdexError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all docdex operations.
#[derive(Debug, thiserror::Error)]
pub enum DocdexError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during crawl, discovery, or fetch.
    #[error("network error: {0}")]
    Network(String),

    /// HTML/XML/PDF parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or vector-store layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Embedding provider error carrying the HTTP status for retry
    /// classification and any `Retry-After` the provider supplied.
    #[error("embedding provider error (HTTP {status}): {message}")]
    Provider {
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    },

    /// Data validation error (bad index name, invalid input, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The session id has no identity link.
    #[error("session is not linked to a user or team")]
    NotLinked,

    /// The caller lacks a sufficient grant on the index (also returned for
    /// unknown indexes so their existence is not leaked).
    #[error("access denied for index {index_name}")]
    AccessDenied { index_name: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DocdexError>;

impl DocdexError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an access-denied error for the given index.
    pub fn access_denied(index_name: impl Into<String>) -> Self {
        Self::AccessDenied {
            index_name: index_name.into(),
        }
    }

    /// Stable kind tag for structured error details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Network(_) => "network",
            Self::Parse { .. } => "parse",
            Self::Storage(_) => "storage",
            Self::Provider { .. } => "provider",
            Self::Validation { .. } => "validation",
            Self::Io { .. } => "io",
            Self::NotLinked => "not_linked",
            Self::AccessDenied { .. } => "access_denied",
        }
    }

    /// Whether a retry layer may re-attempt the operation: provider 429 or
    /// 5xx responses, and transport-level network failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Network(_) => true,
            _ => false,
        }
    }

    /// The provider-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Provider { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DocdexError::config("missing DATABASE_URL");
        assert_eq!(err.to_string(), "config error: missing DATABASE_URL");

        let err = DocdexError::access_denied("docs_foo");
        assert!(err.to_string().contains("docs_foo"));
    }

    #[test]
    fn retryable_classification() {
        let rate_limited = DocdexError::Provider {
            status: 429,
            retry_after: Some(Duration::from_secs(7)),
            message: "slow down".into(),
        };
        assert!(rate_limited.is_retryable());
        assert_eq!(rate_limited.retry_after(), Some(Duration::from_secs(7)));

        let server = DocdexError::Provider {
            status: 503,
            retry_after: None,
            message: "unavailable".into(),
        };
        assert!(server.is_retryable());

        let client = DocdexError::Provider {
            status: 400,
            retry_after: None,
            message: "bad request".into(),
        };
        assert!(!client.is_retryable());

        assert!(DocdexError::Network("timed out".into()).is_retryable());
        assert!(!DocdexError::NotLinked.is_retryable());
    }
}
