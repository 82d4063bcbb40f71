//! Level-triggered reconciliation of tracked issues.
//!
//! This crate implements the controller pattern:
//!
//! - **Desired State**: [`TrackedIssue`](keel_store::TrackedIssue) objects in
//!   the store
//! - **Actual State**: issues on the remote tracker
//! - **Reconcile**: one pass of [`IssueReconciler`] moves a single object a
//!   step closer to its desired state and says when to look again
//! - **Driver**: [`Controller`] turns store changes into queue keys and runs
//!   workers that reconcile them
//!
//! # Reconcile outcomes
//!
//! - `Done` - nothing more to do until the object changes
//! - `RetryNow` - run again as soon as the key is free
//! - `RetryAfter(d)` - run again after a fixed delay; failure backoff is untouched
//! - `Fail(err)` - retry with per-key exponential backoff
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use keel_reconciler::{Controller, ControllerConfig, IssueReconciler, ReconcilerConfig};
//! use keel_remote::MockProvider;
//! use keel_store::InMemoryStore;
//!
//! let store = InMemoryStore::new_arc();
//! let provider = MockProvider::new_arc();
//! let reconciler = Arc::new(IssueReconciler::new(
//!     Arc::clone(&store),
//!     provider,
//!     ReconcilerConfig::default(),
//! ));
//!
//! let handle = Controller::new(reconciler, store, ControllerConfig::default())
//!     .start()
//!     .await?;
//! // ...
//! handle.shutdown().await;
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod controller;
pub mod error;
pub mod reconciler;
pub mod types;

// Re-export main types
pub use controller::{Controller, ControllerConfig, ControllerHandle, ControllerStopper};
pub use error::{Error, Result};
pub use reconciler::{IssueReconciler, MAX_DELAY, Reconcile, ReconcilerConfig};
pub use types::{ReconcileOutcome, desired_update, labels_match};
