//! Object types held by the store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifies an object: namespace plus name.
///
/// Cluster-scoped objects have an empty namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a key from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace/name`, or a bare `name` for cluster-scoped objects.
    pub fn parse(raw: &str) -> Result<Self> {
        let (namespace, name) = match raw.split_once('/') {
            Some((namespace, name)) => (namespace, name),
            None => ("", raw),
        };

        if name.is_empty() {
            return Err(Error::invalid_key(raw, "name must not be empty"));
        }
        if name.contains('/') {
            return Err(Error::invalid_key(raw, "expected at most one '/'"));
        }
        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Compute the queue key for an issue object.
///
/// Fails when the object carries no name; such an event is malformed.
pub fn key_for(issue: &TrackedIssue) -> Result<ObjectKey> {
    if issue.metadata.name.is_empty() {
        return Err(Error::invalid_key(
            format!("{}/", issue.metadata.namespace),
            "object has no name",
        ));
    }
    Ok(issue.metadata.key())
}

/// Metadata common to every stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Assigned by the store on create.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Bumped by the store on every write; writers must echo it back.
    #[serde(default)]
    pub resource_version: u64,
    /// Bumped by the store whenever the spec changes.
    #[serde(default)]
    pub generation: u64,
    /// Set once deletion has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Pending cleanup obligations blocking final removal.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create metadata for a new object.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Desired state of a remote issue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedIssueSpec {
    /// Repository as `owner/repo`.
    pub repo: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Name of the secret, in the same namespace, holding the access token.
    pub token_secret_ref: String,
}

/// Observed state of a remote issue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedIssueStatus {
    /// Remote issue number; 0 until the issue has been created.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub issue_number: u64,
    #[serde(default, rename = "issueURL", skip_serializing_if = "String::is_empty")]
    pub issue_url: String,
    /// Lifecycle state reported by the remote: `open` or `closed`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Status condition. Opaque to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// A remote issue declared by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedIssue {
    pub metadata: ObjectMeta,
    pub spec: TrackedIssueSpec,
    #[serde(default)]
    pub status: TrackedIssueStatus,
}

impl TrackedIssue {
    /// Create an issue object with empty status.
    pub fn new(metadata: ObjectMeta, spec: TrackedIssueSpec) -> Self {
        Self {
            metadata,
            spec,
            status: TrackedIssueStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Whether deletion has been requested.
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    /// Add `finalizer`; returns false when it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata.finalizers.push(finalizer.to_string());
        true
    }

    /// Remove `finalizer`; returns false when it was absent.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.metadata.finalizers.len();
        self.metadata.finalizers.retain(|f| f != finalizer);
        self.metadata.finalizers.len() != before
    }
}

/// Opaque credential material.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
    /// Plain-text entries, folded into `data` when stored.
    #[serde(default, skip_serializing)]
    pub string_data: BTreeMap<String, String>,
}

impl Secret {
    /// Create a secret holding a single entry.
    pub fn with_entry(
        metadata: ObjectMeta,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        let mut data = BTreeMap::new();
        data.insert(key.into(), value.into());
        Self {
            metadata,
            data,
            string_data: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Fold `string_data` into `data`.
    pub(crate) fn normalize(mut self) -> Self {
        let plain = std::mem::take(&mut self.string_data);
        self.data
            .extend(plain.into_iter().map(|(k, v)| (k, v.into_bytes())));
        self
    }
}

// Secret values stay out of logs.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("metadata", &self.metadata)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}
