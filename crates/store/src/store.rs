//! Store accessor trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ObjectKey, Secret, TrackedIssue};
use crate::watch::WatchStream;

/// Typed access to desired-state issue objects and the secrets they refer to.
///
/// Writes are optimistic: `update` and `update_status` compare the caller's
/// `metadata.resource_version` against the stored one and fail with
/// [`Error::Conflict`](crate::Error::Conflict) when it is stale.
#[async_trait]
pub trait IssueStore: Send + Sync {
    /// Read one object.
    async fn get(&self, key: &ObjectKey) -> Result<TrackedIssue>;

    /// List objects, optionally restricted to one namespace, ordered by key.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<TrackedIssue>>;

    /// Create an object. The store assigns uid, resource version and generation.
    async fn create(&self, issue: TrackedIssue) -> Result<TrackedIssue>;

    /// Write spec and metadata. Status is left untouched.
    ///
    /// Removing the last finalizer of an object being deleted removes the
    /// object; the returned value is its final state.
    async fn update(&self, issue: &TrackedIssue) -> Result<TrackedIssue>;

    /// Write status only. Spec and metadata are left untouched.
    async fn update_status(&self, issue: &TrackedIssue) -> Result<TrackedIssue>;

    /// Apply a JSON merge patch to spec and metadata without a version check.
    async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<TrackedIssue>;

    /// Request deletion. Objects with finalizers get a deletion marker and
    /// stay until the finalizers are cleared.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Read a secret.
    async fn get_secret(&self, key: &ObjectKey) -> Result<Secret>;

    /// Subscribe to changes made after this call.
    fn watch(&self) -> WatchStream;
}
