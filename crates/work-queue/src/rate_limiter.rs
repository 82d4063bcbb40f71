//! Rate limiters deciding how long a failed key waits before redelivery.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Decides the delay applied to a key re-added through
/// [`WorkQueue::add_rate_limited`](crate::WorkQueue::add_rate_limited).
pub trait RateLimiter<K>: Send {
    /// Delay for the next delivery of `key`. Each call counts as one failure.
    fn when(&mut self, key: &K) -> Duration;

    /// Stop tracking `key`, resetting its failure history.
    fn forget(&mut self, key: &K);

    /// Number of consecutive failures recorded for `key`.
    fn num_requeues(&self, key: &K) -> u32;
}

/// Calculate exponential backoff duration.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    jitter: bool,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ExponentialBackoff<K> {
    /// Create a limiter doubling from `base` up to `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: false,
            failures: HashMap::new(),
        }
    }

    /// Spread each delay by up to 10% to avoid synchronized retries.
    ///
    /// The ceiling still holds with jitter enabled.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// The delay ceiling.
    pub const fn max_delay(&self) -> Duration {
        self.max
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ExponentialBackoff<K> {
    fn when(&mut self, key: &K) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let attempt = *failures;
        *failures = failures.saturating_add(1);

        let delay = calculate_backoff(attempt, self.base, self.max);
        if self.jitter {
            let spread = rand::thread_rng().gen_range(0.0..=0.1);
            delay.saturating_add(delay.mul_f64(spread)).min(self.max)
        } else {
            delay
        }
    }

    fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

/// Overall token bucket shared by every key.
///
/// Bounds the aggregate retry rate regardless of how many keys are failing.
#[derive(Debug, Clone)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    /// Create a bucket refilled at `qps` tokens per second holding at most `burst`.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: if qps > 0.0 { qps } else { 1.0 },
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-self.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&mut self, _key: &K) -> Duration {
        self.reserve()
    }

    fn forget(&mut self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Applies several limiters and waits for the slowest of them.
pub struct MaxOf<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    /// Combine `limiters`; an empty set never delays.
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOf<K> {
    fn when(&mut self, key: &K) -> Duration {
        // every limiter must observe the failure, so no short-circuiting
        self.limiters
            .iter_mut()
            .map(|limiter| limiter.when(key))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&mut self, key: &K) {
        self.limiters
            .iter_mut()
            .for_each(|limiter| limiter.forget(key));
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff from 5ms to 1000s, combined with an overall
/// 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOf<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    let per_key: Box<dyn RateLimiter<K>> = Box::new(ExponentialBackoff::new(
        Duration::from_millis(5),
        Duration::from_secs(1000),
    ));
    let overall: Box<dyn RateLimiter<K>> = Box::new(BucketRateLimiter::new(10.0, 100));
    MaxOf::new(vec![per_key, overall])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_per_failure() {
        let mut limiter = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
        assert_eq!(limiter.when(&"a"), Duration::from_secs(2));
        assert_eq!(limiter.when(&"a"), Duration::from_secs(4));
        assert_eq!(limiter.num_requeues(&"a"), 3);
    }

    #[test]
    fn test_exponential_is_capped() {
        let mut limiter = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));

        let delays: Vec<Duration> = (0..64).map(|_| limiter.when(&"a")).collect();

        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
        assert_eq!(delays.last().copied(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_exponential_tracks_keys_independently() {
        let mut limiter = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

        limiter.when(&"a");
        limiter.when(&"a");

        assert_eq!(limiter.when(&"b"), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&"a"), 2);
    }

    #[test]
    fn test_forget_resets_backoff() {
        let mut limiter = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        limiter.when(&"a");
        limiter.when(&"a");

        limiter.forget(&"a");

        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_under_ceiling() {
        let mut limiter = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(8))
            .with_jitter(true);

        for attempt in 0..10u32 {
            let delay = limiter.when(&"a");
            let floor = calculate_backoff(attempt, Duration::from_secs(1), Duration::from_secs(8));
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(delay <= Duration::from_secs(8));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_allows_burst_then_spaces_out() {
        let mut limiter = BucketRateLimiter::new(10.0, 2);

        assert_eq!(RateLimiter::<&str>::when(&mut limiter, &"a"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&mut limiter, &"b"), Duration::ZERO);

        let third = RateLimiter::<&str>::when(&mut limiter, &"c");
        assert!(third > Duration::ZERO);
        assert!(third <= Duration::from_millis(101));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_with_tiny_rate_saturates_delay() {
        let mut limiter = BucketRateLimiter::new(1e-300, 1);

        assert_eq!(RateLimiter::<&str>::when(&mut limiter, &"a"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&mut limiter, &"b"), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_of_uses_slowest_limiter() {
        let per_key: Box<dyn RateLimiter<&'static str>> = Box::new(ExponentialBackoff::new(
            Duration::from_secs(3),
            Duration::from_secs(60),
        ));
        let overall: Box<dyn RateLimiter<&'static str>> = Box::new(BucketRateLimiter::new(10.0, 100));
        let mut limiter = MaxOf::new(vec![per_key, overall]);

        assert_eq!(limiter.when(&"a"), Duration::from_secs(3));
        assert_eq!(limiter.num_requeues(&"a"), 1);

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
    }
}
