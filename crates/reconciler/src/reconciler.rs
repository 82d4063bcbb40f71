//! Reconciler implementation.
//!
//! Each attempt starts from the stored object and walks fixed steps: fetch,
//! resolve credential, finalize if deleting, ensure the finalizer, then
//! create or sync the remote issue. No state survives between attempts
//! except what is persisted in the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_remote::{CreateIssue, IssueProvider, IssueState, Token};
use keel_store::{IssueStore, ObjectKey, TrackedIssue};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{ReconcileOutcome, desired_update};

/// Finalizer guarding remote cleanup.
pub const DEFAULT_FINALIZER: &str = "issues.keel.dev/cleanup";

/// Upper bound for every configured delay and interval.
pub const MAX_DELAY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Configuration for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Finalizer added to every managed object.
    pub finalizer: String,
    /// Delay before a converged object is checked again for remote drift.
    pub periodic_requeue: Duration,
    /// Fixed delay after a failed close, reopen or drift update.
    pub remote_retry_delay: Duration,
    /// Secret entry holding the access token.
    pub token_key: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            finalizer: DEFAULT_FINALIZER.to_string(),
            periodic_requeue: Duration::from_secs(5 * 60),
            remote_retry_delay: Duration::from_secs(30),
            token_key: "token".to_string(),
        }
    }
}

impl ReconcilerConfig {
    #[must_use]
    pub fn finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.finalizer = finalizer.into();
        self
    }

    #[must_use]
    pub const fn periodic_requeue(mut self, delay: Duration) -> Self {
        self.periodic_requeue = delay;
        self
    }

    #[must_use]
    pub const fn remote_retry_delay(mut self, delay: Duration) -> Self {
        self.remote_retry_delay = delay;
        self
    }

    #[must_use]
    pub fn token_key(mut self, key: impl Into<String>) -> Self {
        self.token_key = key.into();
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.finalizer.is_empty() {
            return Err(Error::invalid_config("finalizer must not be empty"));
        }
        if self.token_key.is_empty() {
            return Err(Error::invalid_config("token key must not be empty"));
        }
        if self.periodic_requeue.is_zero() {
            return Err(Error::invalid_config("periodic requeue must be positive"));
        }
        if self.remote_retry_delay.is_zero() {
            return Err(Error::invalid_config("remote retry delay must be positive"));
        }
        if self.periodic_requeue > MAX_DELAY || self.remote_retry_delay > MAX_DELAY {
            return Err(Error::invalid_config(format!(
                "requeue delays must not exceed {}s",
                MAX_DELAY.as_secs()
            )));
        }
        Ok(())
    }
}

/// One reconcile pass over the object stored under a key.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileOutcome;
}

/// Keeps a remote issue in line with its [`TrackedIssue`].
pub struct IssueReconciler<S: ?Sized, P: ?Sized> {
    store: Arc<S>,
    provider: Arc<P>,
    config: ReconcilerConfig,
}

impl<S, P> IssueReconciler<S, P>
where
    S: IssueStore + ?Sized,
    P: IssueProvider + ?Sized,
{
    pub fn new(store: Arc<S>, provider: Arc<P>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one attempt, with errors propagated rather than folded into an outcome.
    pub async fn try_reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let issue = match self.store.get(key).await {
            Ok(issue) => issue,
            Err(err) if err.is_not_found() => {
                debug!(phase = "fetch", "object no longer exists");
                return Ok(ReconcileOutcome::Done);
            }
            Err(err) => return Err(err.into()),
        };

        // needed by the deletion branch too
        let token = self.resolve_token(&issue).await?;

        if issue.is_being_deleted() {
            return self.finalize(issue, &token).await;
        }

        if !issue.has_finalizer(&self.config.finalizer) {
            let mut issue = issue;
            issue.add_finalizer(&self.config.finalizer);
            self.store.update(&issue).await?;
            info!(phase = "finalizer", finalizer = %self.config.finalizer, "finalizer added");
            return Ok(ReconcileOutcome::RetryNow);
        }

        if issue.status.issue_number == 0 {
            self.create_remote(issue, &token).await
        } else {
            self.sync_remote(issue, &token).await
        }
    }

    /// Read the token from the secret named by the spec, in the object's namespace.
    async fn resolve_token(&self, issue: &TrackedIssue) -> Result<Token> {
        let secret_key = ObjectKey::new(
            issue.metadata.namespace.clone(),
            issue.spec.token_secret_ref.clone(),
        );
        let secret = self.store.get_secret(&secret_key).await.map_err(|err| {
            if err.is_not_found() {
                Error::secret_not_found(secret_key.to_string())
            } else {
                err.into()
            }
        })?;

        let raw = secret.data.get(&self.config.token_key).ok_or_else(|| {
            Error::invalid_credential(
                secret_key.to_string(),
                format!("no '{}' entry", self.config.token_key),
            )
        })?;
        let token = std::str::from_utf8(raw)
            .map_err(|_| Error::invalid_credential(secret_key.to_string(), "token is not UTF-8"))?
            .trim();
        if token.is_empty() {
            return Err(Error::invalid_credential(
                secret_key.to_string(),
                "token is empty",
            ));
        }
        Ok(Token::new(token))
    }

    async fn finalize(&self, mut issue: TrackedIssue, token: &Token) -> Result<ReconcileOutcome> {
        if !issue.has_finalizer(&self.config.finalizer) {
            debug!(phase = "delete", "no finalizer left, nothing to clean up");
            return Ok(ReconcileOutcome::Done);
        }

        let number = issue.status.issue_number;
        if number > 0 {
            match self.provider.close(token, &issue.spec.repo, number).await {
                Ok(()) => info!(phase = "delete", issue_number = number, "remote issue closed"),
                Err(keel_remote::Error::IssueNotFound { .. }) => {
                    warn!(phase = "delete", issue_number = number, "remote issue already gone");
                }
                Err(err) => {
                    warn!(
                        phase = "delete",
                        issue_number = number,
                        error = %err,
                        "failed to close remote issue, keeping finalizer"
                    );
                    return Ok(ReconcileOutcome::RetryAfter(self.config.remote_retry_delay));
                }
            }
        }

        issue.remove_finalizer(&self.config.finalizer);
        self.store.update(&issue).await?;
        info!(phase = "delete", "finalizer removed");
        Ok(ReconcileOutcome::Done)
    }

    async fn create_remote(
        &self,
        mut issue: TrackedIssue,
        token: &Token,
    ) -> Result<ReconcileOutcome> {
        info!(phase = "create", repo = %issue.spec.repo, title = %issue.spec.title, "creating remote issue");
        let created = self
            .provider
            .create(
                token,
                &CreateIssue {
                    repo: issue.spec.repo.clone(),
                    title: issue.spec.title.clone(),
                    body: issue.spec.body.clone(),
                    labels: issue.spec.labels.clone(),
                },
            )
            .await?;

        issue.status.issue_number = created.number;
        issue.status.issue_url = created.url;
        issue.status.state = created.state.as_str().to_string();
        self.store.update_status(&issue).await?;
        info!(phase = "create", issue_number = created.number, "remote issue created");

        Ok(ReconcileOutcome::RetryAfter(self.config.periodic_requeue))
    }

    async fn sync_remote(&self, mut issue: TrackedIssue, token: &Token) -> Result<ReconcileOutcome> {
        let number = issue.status.issue_number;
        let repo = issue.spec.repo.clone();
        let mut remote = self.provider.get(token, &repo, number).await?;

        if remote.state == IssueState::Closed {
            info!(phase = "sync", issue_number = number, "remote issue closed externally, reopening");
            if let Err(err) = self.provider.reopen(token, &repo, number).await {
                warn!(phase = "sync", issue_number = number, error = %err, "failed to reopen remote issue");
                return Ok(ReconcileOutcome::RetryAfter(self.config.remote_retry_delay));
            }
            remote.state = IssueState::Open;
        }

        let update = desired_update(&issue.spec, &remote);
        if update.is_empty() {
            debug!(phase = "sync", issue_number = number, "remote issue in sync");
        } else {
            info!(
                phase = "sync",
                issue_number = number,
                title = update.title.is_some(),
                body = update.body.is_some(),
                labels = update.labels.is_some(),
                "updating drifted remote issue"
            );
            if let Err(err) = self.provider.update(token, &repo, number, &update).await {
                warn!(phase = "sync", issue_number = number, error = %err, "failed to update remote issue");
                return Ok(ReconcileOutcome::RetryAfter(self.config.remote_retry_delay));
            }
        }

        if issue.status.state != remote.state.as_str() {
            issue.status.state = remote.state.as_str().to_string();
            self.store.update_status(&issue).await?;
        }

        Ok(ReconcileOutcome::RetryAfter(self.config.periodic_requeue))
    }
}

#[async_trait]
impl<S, P> Reconcile for IssueReconciler<S, P>
where
    S: IssueStore + ?Sized,
    P: IssueProvider + ?Sized,
{
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileOutcome {
        self.try_reconcile(key).await.unwrap_or_else(ReconcileOutcome::Fail)
    }
}
