//! Error types for the store crate.

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Store error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Object does not exist.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    /// Object already exists.
    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// Write was based on a stale resource version.
    #[error("conflict writing '{key}': resource version {expected} is stale (current {actual})")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Malformed object key.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Write rejected by object semantics.
    #[error("invalid write to '{key}': {reason}")]
    Invalid { key: String, reason: String },

    /// Merge patch could not be applied.
    #[error("invalid patch: {reason}")]
    InvalidPatch { reason: String },

    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// Watch consumer fell behind and missed events.
    #[error("watch lagged, {skipped} events skipped")]
    Lagged { skipped: u64 },

    #[error("watch channel closed")]
    ChannelClosed,
}

impl Error {
    /// Create a not found error.
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(kind: &'static str, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            key: key.into(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(key: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::Conflict {
            key: key.into(),
            expected,
            actual,
        }
    }

    /// Create an invalid key error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid write error.
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid patch error.
    pub fn invalid_patch(reason: impl Into<String>) -> Self {
        Self::InvalidPatch {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Whether the object is absent.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the write lost a resource-version race.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
