//! Rate limiter coordination logic.
//!
//! The rate limiter decides whether a request for a key is admitted by every
//! rule in a list. It runs each rule against the remote atomic store when that
//! store is healthy, and against a bounded in-process store otherwise.
//!
//! Rate limiting is best-effort: a failing or slow remote store never fails a
//! check. The failure is logged, counted, fed to the health tracker, and the
//! same rule is answered by the fallback.

use crate::application::circuit_breaker::{BackendHealth, HealthConfig, HealthState};
use crate::application::metrics::RateLimiterMetrics;
use crate::application::ports::{Clock, RateLimitStore};
use crate::domain::outcome::{RateLimitResult, RateLimitStatus, RuleOutcome, RuleStatus, ServedBy};
use crate::domain::rule::{Algorithm, RateLimitRule};
use crate::error::{BackendError, BuildError, Error};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::memory_store::{MemoryRateLimitStore, DEFAULT_MAX_TRACKED_KEYS};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Configuration for the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Namespace for every stored key (default: "rate_limit:")
    pub key_prefix: String,
    /// Upper bound on a single remote store call (default: 250 ms)
    pub remote_timeout: Duration,
    /// Keys tracked by the in-process fallback (default: 10 000)
    pub max_tracked_keys: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rate_limit:".to_string(),
            remote_timeout: Duration::from_millis(250),
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
        }
    }
}

/// Multi-rule rate limiter with remote execution and in-process fallback.
///
/// Clones share stores, health and metrics.
///
/// # Example
/// ```
/// use booking_guard::{RateLimitRule, RateLimiter};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = RateLimiter::builder().build()?;
/// let rules = [RateLimitRule::sliding_window(2, 60)?];
///
/// assert!(limiter.check("guest-7", &rules).await?.allowed);
/// assert!(limiter.check("guest-7", &rules).await?.allowed);
/// assert!(!limiter.check("guest-7", &rules).await?.allowed);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiter {
    remote: Option<Arc<dyn RateLimitStore>>,
    local: Arc<MemoryRateLimitStore>,
    health: Arc<BackendHealth>,
    metrics: RateLimiterMetrics,
    clock: Arc<dyn Clock>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    /// Start building a limiter.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Decide whether `key` may proceed under every rule in `rules`.
    ///
    /// Rules are evaluated in order and the first denial ends the check; its
    /// wait becomes `retry_after_secs`. Rules that passed before the denial
    /// keep the request they recorded, so a multi-rule denial over-counts on
    /// the earlier rules. This over-counting is intended and not rolled back.
    ///
    /// An empty rule list admits the request with `remaining = u64::MAX`.
    ///
    /// # Errors
    /// Returns `Error::InvalidRule` if a rule has invalid parameters. Store
    /// failures never surface here.
    pub async fn check(&self, key: &str, rules: &[RateLimitRule]) -> Result<RateLimitResult, Error> {
        validate(rules)?;
        self.metrics.record_check();
        let now = self.clock.now();

        let mut remaining = u64::MAX;
        for rule in rules {
            let outcome = self.evaluate(key, rule, now).await;
            if !outcome.allowed {
                self.metrics.record_throttled();
                tracing::debug!(
                    key,
                    rule = %rule.label(),
                    retry_after_secs = outcome.retry_after.as_secs_f64(),
                    "rate limit exceeded"
                );
                return Ok(RateLimitResult {
                    allowed: false,
                    remaining: 0,
                    retry_after_secs: outcome.retry_after.as_secs_f64(),
                });
            }
            remaining = remaining.min(outcome.remaining);
        }

        self.metrics.record_allowed();
        Ok(RateLimitResult {
            allowed: true,
            remaining,
            retry_after_secs: 0.0,
        })
    }

    /// Like [`check`](Self::check), but a denial becomes
    /// `Error::RateLimitExceeded`.
    pub async fn enforce(&self, key: &str, rules: &[RateLimitRule]) -> Result<RateLimitResult, Error> {
        self.check(key, rules).await?.into_result()
    }

    /// Clear all rule state for `key`, in both stores.
    ///
    /// A remote failure is logged and counted like any other; the local state
    /// is cleared regardless.
    pub async fn reset(&self, key: &str) {
        let prefix = format!("{}{}:", self.config.key_prefix, key);

        if let Some(remote) = self.remote() {
            let result = self.bounded(remote.clear_prefix(&prefix)).await;
            if let Some(removed) = self.settle(result, "reset") {
                tracing::debug!(key, removed, "cleared remote rate-limit state");
            }
        }
        self.local.remove_prefix(&prefix);
    }

    /// Non-mutating view of every rule's state for `key`.
    ///
    /// # Errors
    /// Returns `Error::InvalidRule` if a rule has invalid parameters.
    pub async fn status(&self, key: &str, rules: &[RateLimitRule]) -> Result<RateLimitStatus, Error> {
        validate(rules)?;
        let now = self.clock.now();

        if let Some(remote) = self.remote() {
            let result = self.remote_status(remote.as_ref(), key, rules, now).await;
            if let Some(statuses) = self.settle(result, "status") {
                return Ok(RateLimitStatus {
                    key: key.to_string(),
                    rules: statuses,
                    served_by: ServedBy::Remote,
                });
            }
        }

        Ok(RateLimitStatus {
            key: key.to_string(),
            rules: rules
                .iter()
                .map(|rule| self.local.rule_status(&self.rule_key(key, rule), rule, now))
                .collect(),
            served_by: ServedBy::Local,
        })
    }

    /// Cumulative counters.
    pub fn metrics(&self) -> &RateLimiterMetrics {
        &self.metrics
    }

    /// Health of the remote store.
    pub fn health(&self) -> HealthState {
        self.health.state()
    }

    /// The limiter configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Ping the remote store and restore `Healthy` if it answers.
    ///
    /// Returns whether the remote store is usable. Always `false` without one.
    pub async fn probe_backend(&self) -> bool {
        let Some(remote) = &self.remote else {
            return false;
        };
        let result = self.bounded(remote.ping()).await;
        self.settle(result, "probe").is_some()
    }

    /// Remote store to use for the next operation, if any.
    fn remote(&self) -> Option<&Arc<dyn RateLimitStore>> {
        self.remote
            .as_ref()
            .filter(|_| self.health.allow_remote())
    }

    fn rule_key(&self, key: &str, rule: &RateLimitRule) -> String {
        format!("{}{}:{}", self.config.key_prefix, key, rule.label())
    }

    async fn evaluate(&self, key: &str, rule: &RateLimitRule, now: SystemTime) -> RuleOutcome {
        let store_key = self.rule_key(key, rule);

        if let Some(remote) = self.remote() {
            let result = match &rule.algorithm {
                Algorithm::SlidingWindow(limit) => {
                    self.bounded(remote.hit_sliding_window(&store_key, limit, now))
                        .await
                }
                Algorithm::TokenBucket(limit) => {
                    self.bounded(remote.take_token(&store_key, limit, now)).await
                }
            };
            if let Some(outcome) = self.settle(result, "check") {
                return outcome;
            }
        }

        self.metrics.record_fallback();
        match &rule.algorithm {
            Algorithm::SlidingWindow(limit) => self.local.hit_window(&store_key, limit, now),
            Algorithm::TokenBucket(limit) => self.local.take(&store_key, limit, now),
        }
    }

    async fn remote_status(
        &self,
        remote: &dyn RateLimitStore,
        key: &str,
        rules: &[RateLimitRule],
        now: SystemTime,
    ) -> Result<Vec<RuleStatus>, BackendError> {
        let mut statuses = Vec::with_capacity(rules.len());
        for rule in rules {
            let status = self
                .bounded(remote.status(&self.rule_key(key, rule), rule, now))
                .await?;
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Run a remote call under the configured timeout.
    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        tokio::time::timeout(self.config.remote_timeout, op)
            .await
            .unwrap_or(Err(BackendError::Timeout(self.config.remote_timeout)))
    }

    /// Feed a remote result to the health tracker, keeping the value on success.
    fn settle<T>(&self, result: Result<T, BackendError>, operation: &'static str) -> Option<T> {
        match result {
            Ok(value) => {
                self.health.record_success();
                Some(value)
            }
            Err(e) => {
                self.metrics.record_backend_failure();
                tracing::warn!(error = %e, operation, "remote rate-limit store call failed");
                self.health.record_failure();
                None
            }
        }
    }
}

fn validate(rules: &[RateLimitRule]) -> Result<(), Error> {
    for rule in rules {
        rule.validate()?;
    }
    Ok(())
}

/// Builder for [`RateLimiter`].
#[derive(Debug, Default)]
pub struct RateLimiterBuilder {
    remote: Option<Arc<dyn RateLimitStore>>,
    clock: Option<Arc<dyn Clock>>,
    config: RateLimiterConfig,
    health: HealthConfig,
    metrics: Option<RateLimiterMetrics>,
}

impl RateLimiterBuilder {
    /// Use `remote` as the primary store. Without one, every check is local.
    pub fn with_remote(mut self, remote: Arc<dyn RateLimitStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Time source for windows, refills and reprobe timers.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: RateLimiterConfig) -> Self {
        self.config = config;
        self
    }

    /// Namespace for stored keys.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Upper bound on a single remote call.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.config.remote_timeout = timeout;
        self
    }

    /// Keys tracked by the in-process fallback.
    pub fn with_max_tracked_keys(mut self, max: usize) -> Self {
        self.config.max_tracked_keys = max;
        self
    }

    /// Remote store health tracking.
    pub fn with_health_config(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Share counters with other limiters.
    pub fn with_metrics(mut self, metrics: RateLimiterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the limiter.
    ///
    /// # Errors
    /// Returns `BuildError` if the tracked-key bound, the remote timeout or
    /// the failure threshold is zero.
    pub fn build(self) -> Result<RateLimiter, BuildError> {
        if self.config.remote_timeout.is_zero() {
            return Err(BuildError::ZeroRemoteTimeout);
        }
        if self.health.failure_threshold == 0 {
            return Err(BuildError::ZeroFailureThreshold);
        }
        let local = MemoryRateLimitStore::with_max_tracked_keys(self.config.max_tracked_keys)?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));

        Ok(RateLimiter {
            remote: self.remote,
            local: Arc::new(local),
            health: Arc::new(BackendHealth::new(self.health, Arc::clone(&clock))),
            metrics: self.metrics.unwrap_or_default(),
            clock,
            config: self.config,
        })
    }
}
