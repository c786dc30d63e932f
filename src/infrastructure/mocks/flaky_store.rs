//! Remote store double whose availability tests can switch at will.

use crate::application::ports::RateLimitStore;
use crate::domain::outcome::{RuleOutcome, RuleStatus};
use crate::domain::rule::{RateLimitRule, SlidingWindow, TokenBucket};
use crate::error::BackendError;
use crate::infrastructure::memory_store::MemoryRateLimitStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// [`RateLimitStore`] that behaves like a remote store and can be taken down.
///
/// While available it delegates to its own [`MemoryRateLimitStore`], so its
/// state is separate from a limiter's in-process fallback. While unavailable
/// every call fails with [`BackendError::Unavailable`]. A configured latency
/// is slept before every call, which lets tests exercise timeouts.
///
/// Clones share state and switches.
#[derive(Debug, Clone, Default)]
pub struct FlakyStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    backing: MemoryRateLimitStore,
    down: AtomicBool,
    latency: Mutex<Option<Duration>>,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl FlakyStore {
    /// An available store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail.
    pub fn go_down(&self) {
        self.inner.down.store(true, Ordering::SeqCst);
    }

    /// Make calls succeed again.
    pub fn come_back(&self) {
        self.inner.down.store(false, Ordering::SeqCst);
    }

    /// Sleep this long before answering every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock() = latency;
    }

    /// Calls received, successful or not.
    pub fn calls(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Calls answered with an error.
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::SeqCst)
    }

    /// The state held while available.
    pub fn backing(&self) -> &MemoryRateLimitStore {
        &self.inner.backing
    }

    async fn enter(&self) -> Result<(), BackendError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.inner.down.load(Ordering::SeqCst) {
            self.inner.failures.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for FlakyStore {
    async fn hit_sliding_window(
        &self,
        key: &str,
        limit: &SlidingWindow,
        now: SystemTime,
    ) -> Result<RuleOutcome, BackendError> {
        self.enter().await?;
        Ok(self.inner.backing.hit_window(key, limit, now))
    }

    async fn take_token(
        &self,
        key: &str,
        limit: &TokenBucket,
        now: SystemTime,
    ) -> Result<RuleOutcome, BackendError> {
        self.enter().await?;
        Ok(self.inner.backing.take(key, limit, now))
    }

    async fn status(
        &self,
        key: &str,
        rule: &RateLimitRule,
        now: SystemTime,
    ) -> Result<RuleStatus, BackendError> {
        self.enter().await?;
        Ok(self.inner.backing.rule_status(key, rule, now))
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        self.enter().await?;
        Ok(self.inner.backing.remove_prefix(prefix))
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.enter().await
    }
}
