//! Typed access to desired-state objects held by the control plane.
//!
//! This crate provides the store side of the keel control loop:
//!
//! - **Types**: [`TrackedIssue`] (spec + status), [`Secret`], [`ObjectKey`]
//! - **Accessor**: the [`IssueStore`] trait with conditional writes and a
//!   status-only write path
//! - **Watch**: a stream of [`WatchEvent`]s announcing every change
//! - **In-memory store**: [`InMemoryStore`], a control-plane stand-in with
//!   finalizer and resource-version semantics, seeded from a YAML [`Manifest`]
//!
//! # Example
//!
//! ```ignore
//! use keel_store::{InMemoryStore, IssueStore, ObjectKey};
//!
//! let store = InMemoryStore::new();
//! let mut events = store.watch();
//!
//! store.create(issue).await?;
//! let event = events.recv().await?;
//! let key = ObjectKey::from(event.object());
//! let current = store.get(&key).await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod error;
pub mod manifest;
pub mod memory;
pub mod store;
pub mod types;
pub mod watch;

// Re-export main types
pub use error::{Error, Result};
pub use manifest::Manifest;
pub use memory::InMemoryStore;
pub use store::IssueStore;
pub use types::{
    Condition, ObjectKey, ObjectMeta, Secret, TrackedIssue, TrackedIssueSpec, TrackedIssueStatus,
    key_for,
};
pub use watch::{WatchEvent, WatchStream};
