//! Error types for the remote crate.

use thiserror::Error;

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur talking to the remote issue tracker.
#[derive(Error, Debug)]
pub enum Error {
    /// Repository identifier is not `owner/repo`.
    #[error("invalid repository '{repo}', expected 'owner/repo'")]
    InvalidRepo { repo: String },

    /// Remote issue does not exist.
    #[error("issue {repo}#{number} not found")]
    IssueNotFound { repo: String, number: u64 },

    /// Remote API answered with a non-success status.
    #[error("remote API returned {status}: {body}")]
    Api { status: u16, body: String },

    /// Failure injected by a fake override.
    #[error("injected failure: {reason}")]
    Injected { reason: String },

    /// Configuration error.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// HTTP error from reqwest.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parse error.
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an invalid repository error.
    pub fn invalid_repo(repo: impl Into<String>) -> Self {
        Self::InvalidRepo { repo: repo.into() }
    }

    /// Create an issue not found error.
    pub fn issue_not_found(repo: impl Into<String>, number: u64) -> Self {
        Self::IssueNotFound {
            repo: repo.into(),
            number,
        }
    }

    /// Create an API error.
    pub fn api(status: u16, body: impl Into<String>) -> Self {
        Self::Api {
            status,
            body: body.into(),
        }
    }

    /// Create an injected failure.
    pub fn injected(reason: impl Into<String>) -> Self {
        Self::Injected {
            reason: reason.into(),
        }
    }

    /// Create a config error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Transport failures, throttling and server errors are; bad input and
    /// missing issues are not.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Injected { .. } => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
