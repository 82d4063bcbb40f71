//! Control loop driver.
//!
//! Bridges store change notifications into a [`WorkQueue`] and runs workers
//! that drain it into a [`Reconcile`] implementation.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use keel_store::{IssueStore, ObjectKey, TrackedIssue, WatchEvent, WatchStream, key_for};
use keel_work_queue::{WorkQueue, deadline_after};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{Error, Result};
use crate::reconciler::{MAX_DELAY, Reconcile};
use crate::types::ReconcileOutcome;

/// Configuration for the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Deadline for a single attempt. Zero disables it.
    pub attempt_timeout: Duration,
    /// Interval between full relists. Zero disables it.
    pub resync_interval: Duration,
    /// Only watch objects in this namespace.
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            attempt_timeout: Duration::from_secs(60),
            resync_interval: Duration::ZERO,
            namespace: None,
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub const fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("at least one worker is required"));
        }
        if self.attempt_timeout > MAX_DELAY || self.resync_interval > MAX_DELAY {
            return Err(Error::invalid_config(format!(
                "attempt timeout and resync interval must not exceed {}s",
                MAX_DELAY.as_secs()
            )));
        }
        Ok(())
    }
}

/// Drives reconciliation of every object in a store.
pub struct Controller<R: ?Sized, S: ?Sized> {
    reconciler: Arc<R>,
    store: Arc<S>,
    queue: WorkQueue<ObjectKey>,
    config: ControllerConfig,
}

impl<R, S> Controller<R, S>
where
    R: Reconcile + ?Sized + 'static,
    S: IssueStore + ?Sized + 'static,
{
    pub fn new(reconciler: Arc<R>, store: Arc<S>, config: ControllerConfig) -> Self {
        Self {
            reconciler,
            store,
            queue: WorkQueue::new(),
            config,
        }
    }

    /// Use `queue` instead of a queue with the default rate limiter.
    #[must_use]
    pub fn with_queue(mut self, queue: WorkQueue<ObjectKey>) -> Self {
        self.queue = queue;
        self
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Enqueue every existing object and spawn the watch bridge, the resync
    /// timer and the workers.
    ///
    /// The watch is opened before the initial list so no change made in
    /// between is missed.
    pub async fn start(self) -> Result<ControllerHandle> {
        self.config.validate()?;

        let events = self.store.watch();
        let namespace = self.config.namespace.clone();
        let listed = relist(&*self.store, namespace.as_deref(), &self.queue).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.config.workers.saturating_add(2));

        tasks.push(tokio::spawn(run_watch_bridge(
            Arc::clone(&self.store),
            events,
            self.queue.clone(),
            namespace.clone(),
            stop_rx.clone(),
        )));

        if !self.config.resync_interval.is_zero() {
            tasks.push(tokio::spawn(run_resync(
                Arc::clone(&self.store),
                self.queue.clone(),
                namespace,
                self.config.resync_interval,
                stop_rx.clone(),
            )));
        }

        for worker in 0..self.config.workers {
            tasks.push(tokio::spawn(run_worker(
                worker,
                Arc::clone(&self.reconciler),
                self.queue.clone(),
                self.config.attempt_timeout,
                stop_rx.clone(),
            )));
        }

        info!(
            objects = listed,
            workers = self.config.workers,
            resync_ms = self.config.resync_interval.as_millis(),
            "controller started"
        );

        Ok(ControllerHandle {
            queue: self.queue,
            stop_tx,
            tasks,
        })
    }

    /// Run until `shutdown` completes, then stop and wait for every task.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let handle = self.start().await?;
        shutdown.await;
        handle.shutdown().await;
        Ok(())
    }
}

/// A running controller. Dropping it stops the background tasks without
/// waiting for them.
pub struct ControllerHandle {
    queue: WorkQueue<ObjectKey>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> ControllerStopper {
        ControllerStopper {
            queue: self.queue.clone(),
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Stop every task and wait for them to exit. In-flight attempts are
    /// abandoned at their next suspension point.
    pub async fn shutdown(self) {
        self.stop_tx.send_replace(true);
        self.queue.shut_down();

        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "controller task failed");
            }
        }
        info!("controller stopped");
    }
}

/// Handle to stop a running controller from elsewhere.
#[derive(Clone)]
pub struct ControllerStopper {
    queue: WorkQueue<ObjectKey>,
    stop_tx: watch::Sender<bool>,
}

impl ControllerStopper {
    /// Signal every task to stop. Does not wait.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.queue.shut_down();
    }
}

/// Resolves once a stop was requested or every sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

fn enqueue(queue: &WorkQueue<ObjectKey>, namespace: Option<&str>, issue: &TrackedIssue) {
    if namespace.is_some_and(|ns| ns != issue.metadata.namespace) {
        return;
    }
    match key_for(issue) {
        Ok(key) => queue.add(key),
        // malformed event, retrying would not help
        Err(err) => warn!(error = %err, "dropping event without a usable key"),
    }
}

async fn relist<S>(store: &S, namespace: Option<&str>, queue: &WorkQueue<ObjectKey>) -> Result<usize>
where
    S: IssueStore + ?Sized,
{
    let issues = store.list(namespace).await?;
    for issue in &issues {
        enqueue(queue, namespace, issue);
    }
    Ok(issues.len())
}

async fn run_watch_bridge<S>(
    store: Arc<S>,
    mut events: WatchStream,
    queue: WorkQueue<ObjectKey>,
    namespace: Option<String>,
    mut stop: watch::Receiver<bool>,
) where
    S: IssueStore + ?Sized,
{
    loop {
        let event = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            event = events.recv() => event,
        };

        match event {
            // finalizers already ran before the object disappeared
            Ok(WatchEvent::Deleted(_)) => {}
            Ok(event) => enqueue(&queue, namespace.as_deref(), event.object()),
            Err(keel_store::Error::Lagged { skipped }) => {
                warn!(skipped, "watch fell behind, relisting");
                if let Err(err) = relist(&*store, namespace.as_deref(), &queue).await {
                    error!(error = %err, "relist after lag failed");
                }
            }
            Err(err) => {
                warn!(error = %err, "watch stream ended");
                break;
            }
        }
    }
    debug!("watch bridge stopped");
}

async fn run_resync<S>(
    store: Arc<S>,
    queue: WorkQueue<ObjectKey>,
    namespace: Option<String>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) where
    S: IssueStore + ?Sized,
{
    let mut ticker = tokio::time::interval_at(deadline_after(period), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            _ = ticker.tick() => {
                match relist(&*store, namespace.as_deref(), &queue).await {
                    Ok(objects) => debug!(objects, "resync"),
                    Err(err) => warn!(error = %err, "resync relist failed"),
                }
            }
        }
    }
    debug!("resync stopped");
}

/// Marks the key done however the attempt ends.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<ObjectKey>,
    key: &'a ObjectKey,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

async fn run_worker<R>(
    worker: usize,
    reconciler: Arc<R>,
    queue: WorkQueue<ObjectKey>,
    attempt_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) where
    R: Reconcile + ?Sized,
{
    loop {
        let key = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            key = queue.get() => match key {
                Some(key) => key,
                None => break,
            },
        };
        let _done = DoneGuard {
            queue: &queue,
            key: &key,
        };

        let span = info_span!("reconcile", key = %key, worker);
        let outcome = tokio::select! {
            biased;
            () = stopped(&mut stop) => {
                debug!(parent: &span, "attempt abandoned on shutdown");
                break;
            }
            outcome = attempt(&*reconciler, &key, attempt_timeout).instrument(span.clone()) => outcome,
        };

        span.in_scope(|| apply_outcome(&queue, &key, outcome));
    }
    debug!(worker, "worker stopped");
}

async fn attempt<R>(reconciler: &R, key: &ObjectKey, timeout: Duration) -> ReconcileOutcome
where
    R: Reconcile + ?Sized,
{
    let guarded = AssertUnwindSafe(reconciler.reconcile(key)).catch_unwind();
    let result = if timeout.is_zero() {
        guarded.await
    } else {
        match tokio::time::timeout(timeout, guarded).await {
            Ok(result) => result,
            Err(_) => return ReconcileOutcome::Fail(Error::attempt_timed_out(timeout)),
        }
    };

    result.unwrap_or_else(|payload| ReconcileOutcome::Fail(Error::panicked(panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Success of any kind resets the backoff; only `Fail` grows it.
fn apply_outcome(queue: &WorkQueue<ObjectKey>, key: &ObjectKey, outcome: ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Done => {
            queue.forget(key);
            debug!("reconciled");
        }
        ReconcileOutcome::RetryNow => {
            queue.forget(key);
            queue.add(key.clone());
            debug!("requeued immediately");
        }
        ReconcileOutcome::RetryAfter(delay) => {
            queue.forget(key);
            queue.add_after(key.clone(), delay);
            debug!(delay_ms = delay.as_millis(), "requeued after delay");
        }
        ReconcileOutcome::Fail(err) => {
            queue.add_rate_limited(key.clone());
            error!(
                error = %err,
                failures = queue.num_requeues(key),
                "reconcile failed"
            );
        }
    }
}
