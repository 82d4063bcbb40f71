//! Deterministic in-memory issue tracker for tests and local runs.
//!
//! Every piece of state (issues, number counter, call counters and
//! overrides) sits behind one reader/writer lock, so tests may inspect the
//! fake while a controller is driving it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::provider::IssueProvider;
use crate::types::{CreateIssue, Issue, IssueState, Repo, Token, UpdateIssue};

type CreateHook = Arc<dyn Fn(&CreateIssue) -> Result<Issue> + Send + Sync>;
type GetHook = Arc<dyn Fn(&str, u64) -> Result<Issue> + Send + Sync>;
type UpdateHook = Arc<dyn Fn(&str, u64, &UpdateIssue) -> Result<Issue> + Send + Sync>;
type StateHook = Arc<dyn Fn(&str, u64) -> Result<()> + Send + Sync>;

/// Number of calls made per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    pub create_called: u64,
    pub get_called: u64,
    pub update_called: u64,
    pub close_called: u64,
    pub reopen_called: u64,
}

#[derive(Default)]
struct Hooks {
    create: Option<CreateHook>,
    get: Option<GetHook>,
    update: Option<UpdateHook>,
    close: Option<StateHook>,
    reopen: Option<StateHook>,
}

struct Inner {
    /// Keyed by repository then issue number.
    issues: BTreeMap<(String, u64), Issue>,
    next_number: u64,
    stats: CallStats,
    hooks: Hooks,
}

impl Inner {
    fn new() -> Self {
        Self {
            issues: BTreeMap::new(),
            next_number: 1,
            stats: CallStats::default(),
            hooks: Hooks::default(),
        }
    }

    fn issue_mut(&mut self, repo: &str, number: u64) -> Result<&mut Issue> {
        self.issues
            .get_mut(&(repo.to_string(), number))
            .ok_or_else(|| Error::issue_not_found(repo, number))
    }
}

/// Fake [`IssueProvider`] keeping issues in memory.
///
/// Issue numbers are allocated from one counter shared by all repositories,
/// starting at 1. Tokens are accepted without checking.
pub struct MockProvider {
    inner: RwLock<Inner>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
        }
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Replace `create` with `hook`. The call is still counted.
    pub fn on_create(&self, hook: impl Fn(&CreateIssue) -> Result<Issue> + Send + Sync + 'static) {
        self.inner.write().hooks.create = Some(Arc::new(hook));
    }

    /// Replace `get` with `hook`. The call is still counted.
    pub fn on_get(&self, hook: impl Fn(&str, u64) -> Result<Issue> + Send + Sync + 'static) {
        self.inner.write().hooks.get = Some(Arc::new(hook));
    }

    /// Replace `update` with `hook`. The call is still counted.
    pub fn on_update(
        &self,
        hook: impl Fn(&str, u64, &UpdateIssue) -> Result<Issue> + Send + Sync + 'static,
    ) {
        self.inner.write().hooks.update = Some(Arc::new(hook));
    }

    /// Replace `close` with `hook`. The call is still counted.
    pub fn on_close(&self, hook: impl Fn(&str, u64) -> Result<()> + Send + Sync + 'static) {
        self.inner.write().hooks.close = Some(Arc::new(hook));
    }

    /// Replace `reopen` with `hook`. The call is still counted.
    pub fn on_reopen(&self, hook: impl Fn(&str, u64) -> Result<()> + Send + Sync + 'static) {
        self.inner.write().hooks.reopen = Some(Arc::new(hook));
    }

    /// Drop every override.
    pub fn clear_overrides(&self) {
        self.inner.write().hooks = Hooks::default();
    }

    /// Snapshot of a stored issue, bypassing the counted operations.
    pub fn issue(&self, repo: &str, number: u64) -> Option<Issue> {
        self.inner
            .read()
            .issues
            .get(&(repo.to_string(), number))
            .cloned()
    }

    /// Mutate a stored issue out of band, as a third party on the remote
    /// side would. Returns false when the issue does not exist.
    pub fn modify_issue(&self, repo: &str, number: u64, change: impl FnOnce(&mut Issue)) -> bool {
        let mut inner = self.inner.write();
        match inner.issues.get_mut(&(repo.to_string(), number)) {
            Some(issue) => {
                change(issue);
                true
            }
            None => false,
        }
    }

    /// Store `issue` under `repo` directly. Later creates get higher numbers.
    pub fn insert_issue(&self, repo: &str, issue: Issue) {
        let mut inner = self.inner.write();
        inner.next_number = inner.next_number.max(issue.number.saturating_add(1));
        inner.issues.insert((repo.to_string(), issue.number), issue);
    }

    /// Stored issues with their repository, optionally for one repository,
    /// ordered by repository and number.
    pub fn list_issues(&self, repo: Option<&str>) -> Vec<(String, Issue)> {
        self.inner
            .read()
            .issues
            .iter()
            .filter(|((stored_repo, _), _)| repo.is_none_or(|wanted| stored_repo == wanted))
            .map(|((stored_repo, _), issue)| (stored_repo.clone(), issue.clone()))
            .collect()
    }

    /// Call counters.
    pub fn stats(&self) -> CallStats {
        self.inner.read().stats
    }

    pub fn total_issues(&self) -> usize {
        self.inner.read().issues.len()
    }

    /// Forget every issue, counter and override.
    pub fn reset(&self) {
        *self.inner.write() = Inner::new();
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MockProvider")
            .field("issues", &inner.issues.len())
            .field("next_number", &inner.next_number)
            .field("stats", &inner.stats)
            .finish_non_exhaustive()
    }
}

// Overrides run after the lock is released so they may call back into the fake.
#[async_trait]
impl IssueProvider for MockProvider {
    async fn create(&self, _token: &Token, input: &CreateIssue) -> Result<Issue> {
        let mut inner = self.inner.write();
        inner.stats.create_called = inner.stats.create_called.saturating_add(1);
        if let Some(hook) = inner.hooks.create.clone() {
            drop(inner);
            return hook(input);
        }

        Repo::parse(&input.repo)?;
        let number = inner.next_number;
        inner.next_number = number.saturating_add(1);
        let issue = Issue {
            number,
            url: format!("https://github.com/{}/issues/{number}", input.repo),
            state: IssueState::Open,
            title: input.title.clone(),
            body: input.body.clone(),
            labels: input.labels.clone(),
        };
        inner
            .issues
            .insert((input.repo.clone(), number), issue.clone());
        debug!(repo = %input.repo, number, "fake issue created");
        Ok(issue)
    }

    async fn get(&self, _token: &Token, repo: &str, number: u64) -> Result<Issue> {
        let mut inner = self.inner.write();
        inner.stats.get_called = inner.stats.get_called.saturating_add(1);
        if let Some(hook) = inner.hooks.get.clone() {
            drop(inner);
            return hook(repo, number);
        }

        inner.issue_mut(repo, number).map(|issue| issue.clone())
    }

    async fn update(
        &self,
        _token: &Token,
        repo: &str,
        number: u64,
        input: &UpdateIssue,
    ) -> Result<Issue> {
        let mut inner = self.inner.write();
        inner.stats.update_called = inner.stats.update_called.saturating_add(1);
        if let Some(hook) = inner.hooks.update.clone() {
            drop(inner);
            return hook(repo, number, input);
        }

        let issue = inner.issue_mut(repo, number)?;
        input.apply_to(issue);
        Ok(issue.clone())
    }

    async fn close(&self, _token: &Token, repo: &str, number: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.stats.close_called = inner.stats.close_called.saturating_add(1);
        if let Some(hook) = inner.hooks.close.clone() {
            drop(inner);
            return hook(repo, number);
        }

        inner.issue_mut(repo, number)?.state = IssueState::Closed;
        Ok(())
    }

    async fn reopen(&self, _token: &Token, repo: &str, number: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.stats.reopen_called = inner.stats.reopen_called.saturating_add(1);
        if let Some(hook) = inner.hooks.reopen.clone() {
            drop(inner);
            return hook(repo, number);
        }

        inner.issue_mut(repo, number)?.state = IssueState::Open;
        Ok(())
    }
}
