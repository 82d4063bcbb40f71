//! In-memory store with control-plane write semantics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::store::IssueStore;
use crate::types::{ObjectKey, Secret, TrackedIssue, key_for};
use crate::watch::{WatchEvent, WatchStream};

const ISSUE_KIND: &str = "TrackedIssue";
const SECRET_KIND: &str = "Secret";

/// Default number of watch events buffered per subscriber.
pub const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// Store keeping every object in process memory.
///
/// Resource versions come from one store-wide counter, so every write gets
/// a fresh, increasing version.
pub struct InMemoryStore {
    issues: RwLock<BTreeMap<ObjectKey, TrackedIssue>>,
    secrets: RwLock<BTreeMap<ObjectKey, Secret>>,
    revision: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }

    /// Create an empty store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Create an empty store buffering at most `capacity` events per watcher.
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            issues: RwLock::new(BTreeMap::new()),
            secrets: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            events,
        }
    }

    /// Create a store seeded from `manifest`.
    pub async fn from_manifest(manifest: Manifest) -> Result<Self> {
        let store = Self::new();
        store.load_manifest(manifest).await?;
        Ok(store)
    }

    /// Create every secret and issue in `manifest`.
    pub async fn load_manifest(&self, manifest: Manifest) -> Result<()> {
        for secret in manifest.secrets {
            self.put_secret(secret).await;
        }
        for issue in manifest.issues {
            self.create(issue).await?;
        }
        Ok(())
    }

    /// Create or replace a secret.
    pub async fn put_secret(&self, secret: Secret) {
        let mut secret = secret.normalize();
        secret.metadata.resource_version = self.next_revision();
        let key = secret.key();
        debug!(key = %key, "storing secret");
        self.secrets.write().await.insert(key, secret);
    }

    /// Remove a secret, returning whether it existed.
    pub async fn remove_secret(&self, key: &ObjectKey) -> bool {
        self.secrets.write().await.remove(key).is_some()
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    fn publish(&self, event: WatchEvent) {
        trace!(kind = event.kind(), key = %event.object().key(), "publishing watch event");
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Apply the spec and metadata of `candidate` to the stored object.
    ///
    /// Caller holds the write lock.
    fn write_spec(
        &self,
        issues: &mut BTreeMap<ObjectKey, TrackedIssue>,
        key: &ObjectKey,
        candidate: TrackedIssue,
    ) -> Result<TrackedIssue> {
        let stored = issues
            .get(key)
            .ok_or_else(|| Error::not_found(ISSUE_KIND, key.to_string()))?;

        if stored.is_being_deleted() {
            if let Some(added) = candidate
                .metadata
                .finalizers
                .iter()
                .find(|f| !stored.metadata.finalizers.contains(f))
            {
                return Err(Error::invalid(
                    key.to_string(),
                    format!("finalizer '{added}' may not be added to an object being deleted"),
                ));
            }
        }

        let mut next = stored.clone();
        next.metadata.finalizers = candidate.metadata.finalizers;
        next.metadata.labels = candidate.metadata.labels;
        let spec_changed = next.spec != candidate.spec;
        next.spec = candidate.spec;

        if next == *stored {
            return Ok(next);
        }
        if spec_changed {
            next.metadata.generation = next.metadata.generation.saturating_add(1);
        }
        next.metadata.resource_version = self.next_revision();

        if next.is_being_deleted() && next.metadata.finalizers.is_empty() {
            issues.remove(key);
            debug!(key = %key, "finalizers cleared, object removed");
            self.publish(WatchEvent::Deleted(next.clone()));
        } else {
            issues.insert(key.clone(), next.clone());
            self.publish(WatchEvent::Modified(next.clone()));
        }
        Ok(next)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_version(key: &ObjectKey, incoming: &TrackedIssue, stored: &TrackedIssue) -> Result<()> {
    let expected = incoming.metadata.resource_version;
    let actual = stored.metadata.resource_version;
    if expected != actual {
        return Err(Error::conflict(key.to_string(), expected, actual));
    }
    Ok(())
}

/// Apply an RFC 7386 JSON merge patch to `target`.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(fields) = target {
        for (name, value) in entries {
            if value.is_null() {
                fields.remove(name);
            } else {
                merge_patch(fields.entry(name.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[async_trait]
impl IssueStore for InMemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<TrackedIssue> {
        self.issues
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(ISSUE_KIND, key.to_string()))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<TrackedIssue>> {
        let issues = self.issues.read().await;
        Ok(issues
            .values()
            .filter(|issue| namespace.is_none_or(|ns| issue.metadata.namespace == ns))
            .cloned()
            .collect())
    }

    async fn create(&self, mut issue: TrackedIssue) -> Result<TrackedIssue> {
        let key = key_for(&issue)?;
        let mut issues = self.issues.write().await;
        if issues.contains_key(&key) {
            return Err(Error::already_exists(ISSUE_KIND, key.to_string()));
        }

        let meta = &mut issue.metadata;
        if meta.uid.is_empty() {
            meta.uid = Uuid::new_v4().to_string();
        }
        meta.resource_version = self.next_revision();
        meta.generation = 1;
        meta.deletion_timestamp = None;

        issues.insert(key.clone(), issue.clone());
        debug!(key = %key, "created");
        self.publish(WatchEvent::Added(issue.clone()));
        Ok(issue)
    }

    async fn update(&self, issue: &TrackedIssue) -> Result<TrackedIssue> {
        let key = issue.key();
        let mut issues = self.issues.write().await;
        let stored = issues
            .get(&key)
            .ok_or_else(|| Error::not_found(ISSUE_KIND, key.to_string()))?;
        check_version(&key, issue, stored)?;
        self.write_spec(&mut issues, &key, issue.clone())
    }

    async fn update_status(&self, issue: &TrackedIssue) -> Result<TrackedIssue> {
        let key = issue.key();
        let mut issues = self.issues.write().await;
        let stored = issues
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(ISSUE_KIND, key.to_string()))?;
        check_version(&key, issue, stored)?;

        if stored.status == issue.status {
            return Ok(stored.clone());
        }
        stored.status = issue.status.clone();
        stored.metadata.resource_version = self.next_revision();
        let next = stored.clone();
        self.publish(WatchEvent::Modified(next.clone()));
        Ok(next)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<TrackedIssue> {
        if !patch.is_object() {
            return Err(Error::invalid_patch("merge patch must be a JSON object"));
        }

        let mut issues = self.issues.write().await;
        let stored = issues
            .get(key)
            .ok_or_else(|| Error::not_found(ISSUE_KIND, key.to_string()))?;
        let mut document = serde_json::to_value(stored)?;
        merge_patch(&mut document, patch);
        let candidate: TrackedIssue =
            serde_json::from_value(document).map_err(|err| Error::invalid_patch(err.to_string()))?;

        self.write_spec(&mut issues, key, candidate)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut issues = self.issues.write().await;
        let stored = issues
            .get_mut(key)
            .ok_or_else(|| Error::not_found(ISSUE_KIND, key.to_string()))?;

        if !stored.metadata.finalizers.is_empty() {
            if stored.metadata.deletion_timestamp.is_none() {
                stored.metadata.deletion_timestamp = Some(Utc::now());
                stored.metadata.resource_version = self.next_revision();
                debug!(key = %key, finalizers = ?stored.metadata.finalizers, "deletion requested");
                let marked = stored.clone();
                self.publish(WatchEvent::Modified(marked));
            }
            return Ok(());
        }

        if let Some(removed) = issues.remove(key) {
            debug!(key = %key, "deleted");
            self.publish(WatchEvent::Deleted(removed));
        }
        Ok(())
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<Secret> {
        self.secrets
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(SECRET_KIND, key.to_string()))
    }

    fn watch(&self) -> WatchStream {
        WatchStream::new(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::{ObjectMeta, TrackedIssueSpec};

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    const FINALIZER: &str = "issues.keel.dev/cleanup";

    fn issue(name: &str) -> TrackedIssue {
        TrackedIssue::new(
            ObjectMeta::new("default", name),
            TrackedIssueSpec {
                repo: "octo/hello".to_string(),
                title: "Hello".to_string(),
                body: "first".to_string(),
                labels: vec!["bug".to_string()],
                token_secret_ref: "github-token".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_create_assigns_identity() -> TestResult {
        let store = InMemoryStore::new();

        let created = store.create(issue("a")).await?;

        assert!(!created.metadata.uid.is_empty());
        assert!(created.metadata.resource_version > 0);
        assert_eq!(created.metadata.generation, 1);
        assert_eq!(store.get(&created.key()).await?, created);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_missing_names() -> TestResult {
        let store = InMemoryStore::new();
        store.create(issue("a")).await?;

        let duplicate = store.create(issue("a")).await;
        assert!(matches!(duplicate, Err(Error::AlreadyExists { .. })));

        let unnamed = store.create(issue("")).await;
        assert!(matches!(unnamed, Err(Error::InvalidKey { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryStore::new();

        let result = store.get(&ObjectKey::new("default", "ghost")).await;

        assert!(result.is_err_and(|err| err.is_not_found()));
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() -> TestResult {
        let store = InMemoryStore::new();
        let stale = store.create(issue("a")).await?;

        let mut first = stale.clone();
        first.spec.title = "First".to_string();
        store.update(&first).await?;

        let mut second = stale;
        second.spec.title = "Second".to_string();
        let result = store.update(&second).await;

        assert!(result.is_err_and(|err| err.is_conflict()));
        assert_eq!(store.get(&first.key()).await?.spec.title, "First");
        Ok(())
    }

    #[tokio::test]
    async fn test_generation_tracks_spec_changes_only() -> TestResult {
        let store = InMemoryStore::new();
        let mut current = store.create(issue("a")).await?;

        // Given a metadata-only change
        current.add_finalizer(FINALIZER);
        current = store.update(&current).await?;
        assert_eq!(current.metadata.generation, 1);

        // When the spec changes
        current.spec.title = "Renamed".to_string();
        current = store.update(&current).await?;

        // Then the generation moves
        assert_eq!(current.metadata.generation, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_and_update_status_touch_disjoint_fields() -> TestResult {
        let store = InMemoryStore::new();
        let created = store.create(issue("a")).await?;

        let mut status_write = created.clone();
        status_write.status.issue_number = 42;
        status_write.spec.title = "ignored".to_string();
        let after_status = store.update_status(&status_write).await?;
        assert_eq!(after_status.status.issue_number, 42);
        assert_eq!(after_status.spec.title, "Hello");

        let mut spec_write = after_status.clone();
        spec_write.spec.title = "Renamed".to_string();
        spec_write.status.issue_number = 0;
        let after_spec = store.update(&spec_write).await?;
        assert_eq!(after_spec.spec.title, "Renamed");
        assert_eq!(after_spec.status.issue_number, 42);
        Ok(())
    }

    #[tokio::test]
    async fn test_noop_writes_keep_version_and_stay_quiet() -> TestResult {
        let store = InMemoryStore::new();
        let created = store.create(issue("a")).await?;
        let mut events = store.watch();

        let updated = store.update(&created).await?;
        let status = store.update_status(&created).await?;

        assert_eq!(updated.metadata.resource_version, created.metadata.resource_version);
        assert_eq!(status.metadata.resource_version, created.metadata.resource_version);
        assert_eq!(events.try_recv()?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_without_finalizers_removes_object() -> TestResult {
        let store = InMemoryStore::new();
        let created = store.create(issue("a")).await?;
        let mut events = store.watch();

        store.delete(&created.key()).await?;

        assert!(store.get(&created.key()).await.is_err_and(|e| e.is_not_found()));
        assert!(matches!(events.recv().await?, WatchEvent::Deleted(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() -> TestResult {
        let store = InMemoryStore::new();
        let mut current = store.create(issue("a")).await?;
        current.add_finalizer(FINALIZER);
        store.update(&current).await?;
        let mut events = store.watch();

        // Given a delete request on an object with a finalizer
        store.delete(&current.key()).await?;

        // Then the object stays, marked for deletion
        let mut marked = store.get(&current.key()).await?;
        assert!(marked.is_being_deleted());
        assert!(matches!(events.recv().await?, WatchEvent::Modified(_)));

        // When the finalizer is removed
        marked.remove_finalizer(FINALIZER);
        let last = store.update(&marked).await?;

        // Then the object is gone
        assert!(last.metadata.finalizers.is_empty());
        assert!(store.get(&current.key()).await.is_err_and(|e| e.is_not_found()));
        assert!(matches!(events.recv().await?, WatchEvent::Deleted(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_repeated_delete_keeps_first_marker() -> TestResult {
        let store = InMemoryStore::new();
        let mut current = store.create(issue("a")).await?;
        current.add_finalizer(FINALIZER);
        store.update(&current).await?;

        store.delete(&current.key()).await?;
        let first = store.get(&current.key()).await?;
        store.delete(&current.key()).await?;
        let second = store.get(&current.key()).await?;

        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn test_finalizers_cannot_be_added_while_deleting() -> TestResult {
        let store = InMemoryStore::new();
        let mut current = store.create(issue("a")).await?;
        current.add_finalizer(FINALIZER);
        store.update(&current).await?;
        store.delete(&current.key()).await?;

        let mut marked = store.get(&current.key()).await?;
        marked.add_finalizer("other/finalizer");
        let result = store.update(&marked).await;

        assert!(matches!(result, Err(Error::Invalid { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_patch_merges_spec() -> TestResult {
        let store = InMemoryStore::new();
        let created = store.create(issue("a")).await?;

        let patched = store
            .patch(
                &created.key(),
                &json!({
                    "spec": { "title": "Patched", "body": null },
                    "status": { "issueNumber": 99 }
                }),
            )
            .await?;

        assert_eq!(patched.spec.title, "Patched");
        assert_eq!(patched.spec.body, "");
        assert_eq!(patched.spec.labels, vec!["bug".to_string()]);
        assert_eq!(patched.status.issue_number, 0, "patch must not touch status");
        assert_eq!(patched.metadata.generation, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_patch_rejects_non_object() -> TestResult {
        let store = InMemoryStore::new();
        let created = store.create(issue("a")).await?;

        let result = store.patch(&created.key(), &json!(["title"])).await;

        assert!(matches!(result, Err(Error::InvalidPatch { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_reports_changes_in_order() -> TestResult {
        let store = InMemoryStore::new();
        let mut events = store.watch();

        let created = store.create(issue("a")).await?;
        let mut status = created.clone();
        status.status.state = "open".to_string();
        store.update_status(&status).await?;

        let first = events.recv().await?;
        let second = events.recv().await?;
        assert!(matches!(first, WatchEvent::Added(_)));
        assert!(matches!(second, WatchEvent::Modified(_)));
        assert!(second.object().metadata.resource_version > first.object().metadata.resource_version);
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_watcher_sees_lag() -> TestResult {
        let store = InMemoryStore::with_watch_capacity(1);
        let mut events = store.watch();

        store.create(issue("a")).await?;
        store.create(issue("b")).await?;

        let result = events.recv().await;
        assert!(matches!(result, Err(Error::Lagged { skipped: 1 })));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace() -> TestResult {
        let store = InMemoryStore::new();
        store.create(issue("b")).await?;
        store.create(issue("a")).await?;
        let mut other = issue("c");
        other.metadata.namespace = "team".to_string();
        store.create(other).await?;

        let all = store.list(None).await?;
        let default: Vec<String> = store
            .list(Some("default"))
            .await?
            .into_iter()
            .map(|issue| issue.metadata.name)
            .collect();

        assert_eq!(all.len(), 3);
        assert_eq!(default, vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_secrets_round_trip() -> TestResult {
        let store = InMemoryStore::new();
        let key = ObjectKey::new("default", "github-token");
        let mut secret = Secret {
            metadata: ObjectMeta::new("default", "github-token"),
            ..Secret::default()
        };
        secret
            .string_data
            .insert("token".to_string(), "ghp_test".to_string());

        store.put_secret(secret).await;

        let stored = store.get_secret(&key).await?;
        assert_eq!(stored.data.get("token").map(Vec::as_slice), Some(b"ghp_test".as_slice()));
        assert!(stored.string_data.is_empty());

        assert!(store.remove_secret(&key).await);
        assert!(store.get_secret(&key).await.is_err_and(|e| e.is_not_found()));
        Ok(())
    }

    #[test]
    fn test_merge_patch_replaces_non_objects() {
        let mut target = json!({ "a": { "b": 1 }, "c": [1, 2] });

        merge_patch(&mut target, &json!({ "a": { "d": 2 }, "c": [3] }));

        assert_eq!(target, json!({ "a": { "b": 1, "d": 2 }, "c": [3] }));
    }
}
