//! Client side of the remote issue tracker.
//!
//! - [`IssueProvider`]: the five operations keel performs on a remote issue
//! - [`GitHubProvider`]: live adapter for the GitHub REST API
//! - [`MockProvider`]: deterministic in-memory fake with call counters,
//!   per-call overrides and out-of-band inspection
//! - [`inspect::router`]: read-only HTTP view of a [`MockProvider`]

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod config;
pub mod error;
pub mod github;
pub mod inspect;
pub mod mock;
pub mod provider;
pub mod types;

pub use config::GitHubConfig;
pub use error::{Error, Result};
pub use github::GitHubProvider;
pub use mock::{CallStats, MockProvider};
pub use provider::IssueProvider;
pub use types::{CreateIssue, Issue, IssueState, Repo, Token, UpdateIssue};
