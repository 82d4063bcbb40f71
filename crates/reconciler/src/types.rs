//! Core types for the reconciler.

use std::fmt;
use std::time::Duration;

use itertools::Itertools;
use keel_remote::{Issue, UpdateIssue};
use keel_store::TrackedIssueSpec;

use crate::error::Error;

/// Result of one reconcile attempt.
///
/// Fixed-delay requeues and failure backoff are separate channels: only
/// `Fail` grows the per-key backoff.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Converged; wait for the next change.
    Done,
    /// Run again as soon as the key is released.
    RetryNow,
    /// Run again after a fixed delay.
    RetryAfter(Duration),
    /// Attempt failed; retry with backoff.
    Fail(Error),
}

impl ReconcileOutcome {
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Fail(_))
    }

    /// Delay before the next attempt requested by the outcome itself.
    pub const fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::RetryNow => Some(Duration::ZERO),
            Self::RetryAfter(delay) => Some(*delay),
            Self::Done | Self::Fail(_) => None,
        }
    }

    /// The failure, if any.
    pub const fn error(&self) -> Option<&Error> {
        match self {
            Self::Fail(err) => Some(err),
            _ => None,
        }
    }
}

impl From<Error> for ReconcileOutcome {
    fn from(err: Error) -> Self {
        Self::Fail(err)
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::RetryNow => write!(f, "retry now"),
            Self::RetryAfter(delay) => write!(f, "retry after {}ms", delay.as_millis()),
            Self::Fail(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Label sets are equal regardless of order and duplicates.
pub fn labels_match(a: &[String], b: &[String]) -> bool {
    itertools::equal(a.iter().sorted().dedup(), b.iter().sorted().dedup())
}

/// Fields of `remote` that differ from `spec`, as an update carrying the
/// spec's values. Empty when the remote issue is in sync.
///
/// The spec is authoritative: an empty label list clears remote labels and
/// an empty body clears the remote body.
pub fn desired_update(spec: &TrackedIssueSpec, remote: &Issue) -> UpdateIssue {
    let mut update = UpdateIssue::default();
    if remote.title != spec.title {
        update.title = Some(spec.title.clone());
    }
    if remote.body != spec.body {
        update.body = Some(spec.body.clone());
    }
    if !labels_match(&remote.labels, &spec.labels) {
        update.labels = Some(spec.labels.clone());
    }
    update
}
