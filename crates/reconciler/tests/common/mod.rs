//! Shared fixtures for reconciler integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keel_reconciler::{IssueReconciler, Reconcile, ReconcileOutcome, ReconcilerConfig};
use keel_remote::MockProvider;
use keel_store::{
    InMemoryStore, IssueStore, ObjectKey, ObjectMeta, Secret, TrackedIssue, TrackedIssueSpec,
    WatchStream,
};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub const NAMESPACE: &str = "default";
pub const REPO: &str = "octo/hello";
pub const SECRET: &str = "github-token";

pub fn spec(title: &str) -> TrackedIssueSpec {
    TrackedIssueSpec {
        repo: REPO.to_string(),
        title: title.to_string(),
        body: "Fails one run in ten".to_string(),
        labels: vec!["bug".to_string(), "ci".to_string()],
        token_secret_ref: SECRET.to_string(),
    }
}

pub fn token_secret() -> Secret {
    Secret::with_entry(ObjectMeta::new(NAMESPACE, SECRET), "token", "ghp_test")
}

/// A store and a fake tracker wired to one reconciler.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub provider: Arc<MockProvider>,
    pub reconciler: Arc<IssueReconciler<InMemoryStore, MockProvider>>,
}

impl Harness {
    /// Harness whose namespace holds a valid token secret.
    pub async fn new() -> Self {
        let harness = Self::without_secret();
        harness.store.put_secret(token_secret()).await;
        harness
    }

    pub fn without_secret() -> Self {
        Self::with_config(ReconcilerConfig::default())
    }

    pub fn with_config(config: ReconcilerConfig) -> Self {
        let store = InMemoryStore::new_arc();
        let provider = MockProvider::new_arc();
        let reconciler = Arc::new(IssueReconciler::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            config,
        ));
        Self {
            store,
            provider,
            reconciler,
        }
    }

    pub async fn create(&self, name: &str, spec: TrackedIssueSpec) -> Result<ObjectKey, keel_store::Error> {
        let issue = TrackedIssue::new(ObjectMeta::new(NAMESPACE, name), spec);
        Ok(self.store.create(issue).await?.key())
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileOutcome {
        self.reconciler.reconcile(key).await
    }

    /// Run the finalizer and create passes so the object tracks a remote issue.
    pub async fn converge(&self, key: &ObjectKey) -> Result<TrackedIssue, Box<dyn std::error::Error>> {
        let first = self.reconcile(key).await;
        if !matches!(first, ReconcileOutcome::RetryNow) {
            return Err(format!("expected immediate requeue, got {first}").into());
        }
        let second = self.reconcile(key).await;
        if !matches!(second, ReconcileOutcome::RetryAfter(_)) {
            return Err(format!("expected periodic requeue, got {second}").into());
        }
        Ok(self.store.get(key).await?)
    }
}

/// In-memory store whose writes can be made to lose the version race.
pub struct ConflictingStore {
    inner: Arc<InMemoryStore>,
    reject_updates: AtomicBool,
    reject_status_updates: AtomicBool,
}

impl ConflictingStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reject_updates: AtomicBool::new(false),
            reject_status_updates: AtomicBool::new(false),
        })
    }

    pub fn reject_updates(&self, reject: bool) {
        self.reject_updates.store(reject, Ordering::SeqCst);
    }

    pub fn reject_status_updates(&self, reject: bool) {
        self.reject_status_updates.store(reject, Ordering::SeqCst);
    }

    fn conflict(issue: &TrackedIssue) -> keel_store::Error {
        let expected = issue.metadata.resource_version;
        keel_store::Error::conflict(issue.key().to_string(), expected, expected.saturating_add(1))
    }
}

#[async_trait]
impl IssueStore for ConflictingStore {
    async fn get(&self, key: &ObjectKey) -> keel_store::Result<TrackedIssue> {
        self.inner.get(key).await
    }

    async fn list(&self, namespace: Option<&str>) -> keel_store::Result<Vec<TrackedIssue>> {
        self.inner.list(namespace).await
    }

    async fn create(&self, issue: TrackedIssue) -> keel_store::Result<TrackedIssue> {
        self.inner.create(issue).await
    }

    async fn update(&self, issue: &TrackedIssue) -> keel_store::Result<TrackedIssue> {
        if self.reject_updates.load(Ordering::SeqCst) {
            return Err(Self::conflict(issue));
        }
        self.inner.update(issue).await
    }

    async fn update_status(&self, issue: &TrackedIssue) -> keel_store::Result<TrackedIssue> {
        if self.reject_status_updates.load(Ordering::SeqCst) {
            return Err(Self::conflict(issue));
        }
        self.inner.update_status(issue).await
    }

    async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> keel_store::Result<TrackedIssue> {
        self.inner.patch(key, patch).await
    }

    async fn delete(&self, key: &ObjectKey) -> keel_store::Result<()> {
        self.inner.delete(key).await
    }

    async fn get_secret(&self, key: &ObjectKey) -> keel_store::Result<Secret> {
        self.inner.get_secret(key).await
    }

    fn watch(&self) -> WatchStream {
        self.inner.watch()
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
