//! Error types for the reconciler crate.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Store read or write failed.
    #[error("store error: {0}")]
    Store(#[from] keel_store::Error),

    /// Remote tracker call failed.
    #[error("remote error: {0}")]
    Remote(#[from] keel_remote::Error),

    /// Referenced credential secret does not exist.
    #[error("secret '{key}' not found")]
    SecretNotFound { key: String },

    /// Credential secret exists but holds no usable token.
    #[error("invalid credential in secret '{key}': {reason}")]
    InvalidCredential { key: String, reason: String },

    /// Attempt exceeded its deadline.
    #[error("reconcile attempt timed out after {timeout_ms}ms")]
    AttemptTimedOut { timeout_ms: u64 },

    /// Attempt panicked.
    #[error("reconcile attempt panicked: {message}")]
    Panicked { message: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a secret not found error.
    pub fn secret_not_found(key: impl Into<String>) -> Self {
        Self::SecretNotFound { key: key.into() }
    }

    /// Create an invalid credential error.
    pub fn invalid_credential(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCredential {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an attempt timeout error.
    pub fn attempt_timed_out(timeout: Duration) -> Self {
        Self::AttemptTimedOut {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a panicked error.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked {
            message: message.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the reconciled object itself no longer exists.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_not_found())
    }

    /// Whether a store write lost an optimistic-concurrency race.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_conflict())
    }

    /// Whether the credential is missing or unusable.
    pub const fn is_credential_error(&self) -> bool {
        matches!(
            self,
            Self::SecretNotFound { .. } | Self::InvalidCredential { .. }
        )
    }
}
