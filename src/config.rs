//! Process configuration: TOML file, then `KEEL_*` environment overrides.

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use keel_reconciler::{ControllerConfig, MAX_DELAY, ReconcilerConfig};
use keel_remote::GitHubConfig;
use keel_store::ObjectKey;
use keel_work_queue::{BucketRateLimiter, ExponentialBackoff, MaxOf, RateLimiter, WorkQueue};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which tracker the controller talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMode {
    #[default]
    Github,
    /// In-memory tracker with an inspection endpoint.
    Fake,
}

impl FromStr for RemoteMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "github" => Ok(Self::Github),
            "fake" => Ok(Self::Fake),
            other => anyhow::bail!("unknown remote mode '{other}'"),
        }
    }
}

/// Per-key failure backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_secs: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 5,
            max_secs: 1000,
            jitter: false,
        }
    }
}

/// Overall retry rate shared by every key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BucketConfig {
    pub qps: f64,
    pub burst: u32,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            qps: 10.0,
            burst: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileSection {
    pub finalizer: String,
    #[serde(with = "duration_secs")]
    pub periodic_requeue: Duration,
    #[serde(with = "duration_secs")]
    pub remote_retry_delay: Duration,
    pub token_key: String,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        let defaults = ReconcilerConfig::default();
        Self {
            finalizer: defaults.finalizer,
            periodic_requeue: defaults.periodic_requeue,
            remote_retry_delay: defaults.remote_retry_delay,
            token_key: defaults.token_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteSection {
    pub mode: RemoteMode,
    pub api_url: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for RemoteSection {
    fn default() -> Self {
        let defaults = GitHubConfig::default();
        Self {
            mode: RemoteMode::default(),
            api_url: defaults.api_url,
            timeout: defaults.timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InspectSection {
    /// Address of the fake tracker's inspection endpoint.
    pub listen: SocketAddr,
}

impl Default for InspectSection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8088)),
        }
    }
}

/// Top-level configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeelConfig {
    pub workers: usize,
    #[serde(with = "duration_secs")]
    pub attempt_timeout: Duration,
    /// Full relist period; 0 disables it.
    #[serde(with = "duration_secs")]
    pub resync_interval: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub backoff: BackoffConfig,
    pub bucket: BucketConfig,
    pub reconcile: ReconcileSection,
    pub remote: RemoteSection,
    pub inspect: InspectSection,
}

impl Default for KeelConfig {
    fn default() -> Self {
        let controller = ControllerConfig::default();
        Self {
            workers: controller.workers,
            attempt_timeout: controller.attempt_timeout,
            resync_interval: Duration::from_secs(10 * 60),
            namespace: None,
            backoff: BackoffConfig::default(),
            bucket: BucketConfig::default(),
            reconcile: ReconcileSection::default(),
            remote: RemoteSection::default(),
            inspect: InspectSection::default(),
        }
    }
}

impl KeelConfig {
    /// Read `path` when given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Override fields from `KEEL_*` variables looked up through `lookup`.
    /// Unparsable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(workers) = parsed(&lookup, "KEEL_WORKERS") {
            self.workers = workers;
        }
        if let Some(secs) = parsed(&lookup, "KEEL_ATTEMPT_TIMEOUT_SECS") {
            self.attempt_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed(&lookup, "KEEL_RESYNC_INTERVAL_SECS") {
            self.resync_interval = Duration::from_secs(secs);
        }
        if let Some(namespace) = lookup("KEEL_NAMESPACE") {
            self.namespace = Some(namespace).filter(|ns| !ns.is_empty());
        }
        if let Some(secs) = parsed(&lookup, "KEEL_PERIODIC_REQUEUE_SECS") {
            self.reconcile.periodic_requeue = Duration::from_secs(secs);
        }
        if let Some(mode) = parsed(&lookup, "KEEL_REMOTE_MODE") {
            self.remote.mode = mode;
        }
        if let Some(url) = lookup("KEEL_GITHUB_API_URL") {
            self.remote.api_url = url;
        }
        if let Some(secs) = parsed(&lookup, "KEEL_GITHUB_TIMEOUT_SECS") {
            self.remote.timeout = Duration::from_secs(secs);
        }
        if let Some(listen) = parsed(&lookup, "KEEL_INSPECT_LISTEN") {
            self.inspect.listen = listen;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.controller_config().validate()?;
        self.reconciler_config().validate()?;
        ensure!(self.backoff.base_ms > 0, "backoff.base_ms must be positive");
        ensure!(
            self.backoff.max_secs <= MAX_DELAY.as_secs(),
            "backoff.max_secs must not exceed {}",
            MAX_DELAY.as_secs()
        );
        ensure!(
            Duration::from_millis(self.backoff.base_ms) <= Duration::from_secs(self.backoff.max_secs),
            "backoff.base_ms must not exceed backoff.max_secs"
        );
        ensure!(
            self.bucket.qps.is_finite() && self.bucket.qps > 0.0,
            "bucket.qps must be a positive number"
        );
        ensure!(self.bucket.burst > 0, "bucket.burst must be positive");
        if self.remote.mode == RemoteMode::Github {
            url::Url::parse(&self.remote.api_url)
                .with_context(|| format!("remote.api_url '{}' is not a URL", self.remote.api_url))?;
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let config = ControllerConfig::default()
            .workers(self.workers)
            .attempt_timeout(self.attempt_timeout)
            .resync_interval(self.resync_interval);
        match &self.namespace {
            Some(namespace) => config.namespace(namespace.clone()),
            None => config,
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig::default()
            .finalizer(self.reconcile.finalizer.clone())
            .periodic_requeue(self.reconcile.periodic_requeue)
            .remote_retry_delay(self.reconcile.remote_retry_delay)
            .token_key(self.reconcile.token_key.clone())
    }

    pub fn github_config(&self) -> GitHubConfig {
        GitHubConfig::with_api_url(self.remote.api_url.clone()).timeout(self.remote.timeout)
    }

    /// Queue backed by per-key backoff and the overall bucket.
    pub fn work_queue(&self) -> WorkQueue<ObjectKey> {
        let per_key: Box<dyn RateLimiter<ObjectKey>> = Box::new(
            ExponentialBackoff::new(
                Duration::from_millis(self.backoff.base_ms),
                Duration::from_secs(self.backoff.max_secs),
            )
            .with_jitter(self.backoff.jitter),
        );
        let overall: Box<dyn RateLimiter<ObjectKey>> =
            Box::new(BucketRateLimiter::new(self.bucket.qps, self.bucket.burst));
        WorkQueue::with_rate_limiter(MaxOf::new(vec![per_key, overall]))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    let value = raw.trim().parse().ok();
    if value.is_none() {
        warn!(variable = name, value = %raw, "ignoring unparsable environment override");
    }
    value
}

/// Serialization helper for Duration as seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
