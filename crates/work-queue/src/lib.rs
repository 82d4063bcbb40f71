//! # Work Queue
//!
//! The scheduling primitive of the keel control loop.
//!
//! A [`WorkQueue`] is a *set* of pending keys, not a list: adding a key that is
//! already pending is a no-op, and adding a key that is currently being
//! processed only marks it dirty so it is delivered again once the worker
//! calls [`WorkQueue::done`]. A single key is therefore never handed to two
//! workers at the same time.
//!
//! On top of the plain set semantics the queue supports delayed adds
//! ([`WorkQueue::add_after`]) and failure backoff
//! ([`WorkQueue::add_rate_limited`] / [`WorkQueue::forget`]) driven by a
//! pluggable [`RateLimiter`].
//!
//! ```ignore
//! use keel_work_queue::WorkQueue;
//!
//! let queue = WorkQueue::new();
//! queue.add("default/my-issue".to_string());
//!
//! while let Some(key) = queue.get().await {
//!     match process(&key).await {
//!         Ok(()) => queue.forget(&key),
//!         Err(_) => queue.add_rate_limited(key.clone()),
//!     }
//!     queue.done(&key);
//! }
//! ```

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod queue;
pub mod rate_limiter;

pub use queue::{WorkQueue, deadline_after};
pub use rate_limiter::{
    BucketRateLimiter, ExponentialBackoff, MaxOf, RateLimiter, default_controller_rate_limiter,
};
