//! Deduplicating work queue with in-flight tracking, delayed adds and
//! failure backoff.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::rate_limiter::{RateLimiter, default_controller_rate_limiter};

/// Slot in the delayed-add index: ready time plus an insertion sequence so
/// equal deadlines stay distinct.
type Slot = (Instant, u64);

/// Ceiling for delays; roughly thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// The instant `delay` from now, clamped to a far-future deadline so huge
/// delays never overflow.
pub fn deadline_after(delay: Duration) -> Instant {
    Instant::now() + delay.min(FAR_FUTURE)
}

/// A set of pending keys handed out to workers one at a time.
///
/// Cloning the queue yields another handle to the same backlog.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    limiter: Mutex<Box<dyn RateLimiter<K>>>,
    /// Wakes workers blocked in `get`.
    ready: Notify,
    /// Wakes `shut_down_with_drain` when nothing is in flight.
    idle: Notify,
}

struct State<K> {
    /// Keys ready for delivery, in arrival order.
    queue: VecDeque<K>,
    /// Keys that need processing: everything in `queue` plus keys re-added
    /// while in flight.
    dirty: HashSet<K>,
    /// Keys handed out by `get` and not yet returned through `done`.
    processing: HashSet<K>,
    /// Delayed adds ordered by ready time.
    waiting: BTreeMap<Slot, K>,
    waiting_index: HashMap<K, Slot>,
    next_seq: u64,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: BTreeMap::new(),
            waiting_index: HashMap::new(),
            next_seq: 0,
            shutting_down: false,
        }
    }

    /// Mark `key` dirty; returns true when it became deliverable.
    fn insert(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Schedule `key` for `at`. An earlier pending deadline for the same key
    /// wins over a later one.
    fn schedule(&mut self, key: K, at: Instant) {
        if let Some(&slot) = self.waiting_index.get(&key) {
            if slot.0 <= at {
                return;
            }
            self.waiting.remove(&slot);
        }
        let slot = (at, self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.waiting.insert(slot, key.clone());
        self.waiting_index.insert(key, slot);
    }

    /// Move every delayed key whose deadline has passed into the queue.
    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.waiting.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.waiting_index.remove(&key);
            self.insert(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.keys().next().map(|(at, _)| *at)
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Create a queue using [`default_controller_rate_limiter`].
    pub fn new() -> Self {
        Self::with_rate_limiter(default_controller_rate_limiter())
    }

    /// Create a queue whose failure backoff is decided by `limiter`.
    pub fn with_rate_limiter(limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new()),
                limiter: Mutex::new(Box::new(limiter)),
                ready: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Add `key` unless it is already pending. Ignored after shutdown.
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return;
        }
        if state.insert(key) {
            drop(state);
            self.inner.ready.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return;
        }
        state.schedule(key, deadline_after(delay));
        drop(state);

        // sleeping workers recompute their wake-up deadline
        self.inner.ready.notify_waiters();
    }

    /// Add `key` after the delay chosen by the rate limiter, counting one
    /// more failure for it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.lock().when(&key);
        trace!(delay_ms = delay.as_millis(), "rate limited requeue");
        self.add_after(key, delay);
    }

    /// Reset the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.inner.limiter.lock().forget(key);
    }

    /// Consecutive failures recorded for `key`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.lock().num_requeues(key)
    }

    /// Wait for the next key and mark it in flight.
    ///
    /// Returns `None` once the queue is shut down and every ready key has
    /// been handed out.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.inner.state.lock();
                state.promote_due(Instant::now());

                if let Some(key) = state.queue.pop_front() {
                    state.processing.insert(key.clone());
                    state.dirty.remove(&key);
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.ready.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        () = notified.as_mut() => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release the in-flight mark on `key`. A key re-added while in flight
    /// becomes deliverable again.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);

        let requeued = if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            true
        } else {
            false
        };
        let idle = state.processing.is_empty();
        drop(state);

        if requeued {
            self.inner.ready.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Number of keys ready for delivery.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no key is ready for delivery.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys waiting on a delayed add.
    pub fn delayed_len(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    /// Stop accepting keys. Blocked and future `get` calls drain the ready
    /// keys and then return `None`; delayed adds are discarded.
    pub fn shut_down(&self) {
        let mut state = self.inner.state.lock();
        state.shutting_down = true;
        state.waiting.clear();
        state.waiting_index.clear();
        drop(state);

        self.inner.ready.notify_waiters();
    }

    /// Shut down and wait until every in-flight key has been marked done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.state.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Whether [`shut_down`](Self::shut_down) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkQueue")
            .field("ready", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("delayed", &state.waiting.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}
