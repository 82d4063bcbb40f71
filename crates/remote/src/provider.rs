//! The capability set keel needs from a remote issue tracker.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{CreateIssue, Issue, Token, UpdateIssue};

/// Operations on remote issues, authenticated with a bearer [`Token`].
///
/// `repo` is always `owner/repo`.
#[async_trait]
pub trait IssueProvider: Send + Sync {
    /// Open a new issue.
    async fn create(&self, token: &Token, input: &CreateIssue) -> Result<Issue>;

    /// Read an issue.
    async fn get(&self, token: &Token, repo: &str, number: u64) -> Result<Issue>;

    /// Change the fields present in `input`.
    async fn update(
        &self,
        token: &Token,
        repo: &str,
        number: u64,
        input: &UpdateIssue,
    ) -> Result<Issue>;

    /// Close an issue.
    async fn close(&self, token: &Token, repo: &str, number: u64) -> Result<()>;

    /// Reopen a closed issue.
    async fn reopen(&self, token: &Token, repo: &str, number: u64) -> Result<()>;
}

#[async_trait]
impl<P: IssueProvider + ?Sized> IssueProvider for Arc<P> {
    async fn create(&self, token: &Token, input: &CreateIssue) -> Result<Issue> {
        (**self).create(token, input).await
    }

    async fn get(&self, token: &Token, repo: &str, number: u64) -> Result<Issue> {
        (**self).get(token, repo, number).await
    }

    async fn update(
        &self,
        token: &Token,
        repo: &str,
        number: u64,
        input: &UpdateIssue,
    ) -> Result<Issue> {
        (**self).update(token, repo, number, input).await
    }

    async fn close(&self, token: &Token, repo: &str, number: u64) -> Result<()> {
        (**self).close(token, repo, number).await
    }

    async fn reopen(&self, token: &Token, repo: &str, number: u64) -> Result<()> {
        (**self).reopen(token, repo, number).await
    }
}
