//! Rate/retry governor: exponential backoff for transient provider errors and
//! per-source token bucket admission.
//!
//! Buckets live behind [`RateLimitBackend`]. [`MemoryRateLimiter`] keeps them
//! in a sharded in-process map; [`SharedRateLimiter`] keeps them in an external
//! [`BucketStore`] updated by compare-and-swap so several gateway instances
//! share one budget per source. Neither runs a background timer: idle buckets
//! are dropped when their shard is next touched.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use storegate_common::{Error, Result, SourceId};
use storegate_storage::{RateQuota, StorageAdapter};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given retry number (0 for the first retry).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Token bucket state. Timestamps are wall-clock milliseconds so the state
/// can be shared between hosts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub updated_ms: i64,
    /// No tokens are handed out before this instant.
    pub paused_until_ms: i64,
}

impl BucketState {
    pub fn full(quota: RateQuota, now_ms: i64) -> Self {
        Self {
            tokens: f64::from(quota.burst.max(1)),
            updated_ms: now_ms,
            paused_until_ms: 0,
        }
    }

    fn refill(&mut self, quota: RateQuota, now_ms: i64) {
        let elapsed = (now_ms - self.updated_ms).max(0) as f64 / 1000.0;
        let capacity = f64::from(quota.burst.max(1));
        self.tokens = (self.tokens + elapsed * quota.per_second).min(capacity);
        self.updated_ms = self.updated_ms.max(now_ms);
    }

    /// Take one token. Returns how long to wait when none is available.
    pub fn try_acquire(&mut self, quota: RateQuota, now_ms: i64) -> Option<Duration> {
        self.refill(quota, now_ms);
        if self.paused_until_ms > now_ms {
            return Some(Duration::from_millis((self.paused_until_ms - now_ms) as u64));
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            let per_second = quota.per_second.max(f64::EPSILON);
            Some(Duration::from_secs_f64(deficit / per_second).max(Duration::from_millis(1)))
        }
    }

    /// Hold every caller back until `until_ms`.
    pub fn pause_until(&mut self, until_ms: i64) {
        self.paused_until_ms = self.paused_until_ms.max(until_ms);
    }

    fn is_idle(&self, now_ms: i64, expiry_ms: i64) -> bool {
        self.paused_until_ms <= now_ms && now_ms - self.updated_ms > expiry_ms
    }
}

/// Storage for per-source token buckets.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Take one token for `key`; `Some(wait)` when the caller must wait first.
    async fn try_acquire(&self, key: &str, quota: RateQuota) -> Result<Option<Duration>>;

    /// Stop admitting calls for `key` for `delay`.
    async fn pause(&self, key: &str, quota: RateQuota, delay: Duration) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process buckets in a sharded map with lazy expiry.
pub struct MemoryRateLimiter {
    shards: Vec<Mutex<HashMap<String, BucketState>>>,
    idle_expiry: Duration,
}

impl MemoryRateLimiter {
    pub fn new(shards: usize, idle_expiry: Duration) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            idle_expiry,
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, BucketState>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    fn with_bucket<R>(
        &self,
        key: &str,
        quota: RateQuota,
        f: impl FnOnce(&mut BucketState, i64) -> R,
    ) -> R {
        let now = now_ms();
        let expiry = self.idle_expiry.as_millis() as i64;
        let mut shard = lock(self.shard(key));
        shard.retain(|k, bucket| k == key || !bucket.is_idle(now, expiry));
        let bucket = shard
            .entry(key.to_string())
            .or_insert_with(|| BucketState::full(quota, now));
        f(bucket, now)
    }

    /// Number of live buckets, for diagnostics.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| lock(s).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::new(16, Duration::from_secs(600))
    }
}

#[async_trait]
impl RateLimitBackend for MemoryRateLimiter {
    async fn try_acquire(&self, key: &str, quota: RateQuota) -> Result<Option<Duration>> {
        Ok(self.with_bucket(key, quota, |bucket, now| bucket.try_acquire(quota, now)))
    }

    async fn pause(&self, key: &str, quota: RateQuota, delay: Duration) -> Result<()> {
        self.with_bucket(key, quota, |bucket, now| {
            bucket.pause_until(now + delay.as_millis() as i64)
        });
        Ok(())
    }
}

/// A bucket with the version it was read at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionedBucket {
    pub state: BucketState,
    pub version: u64,
}

/// External store for shared buckets (a database row per source).
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<VersionedBucket>>;

    /// Write `state` only if the stored version is still `expected` (`None`
    /// meaning absent). Returns `false` when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: BucketState,
    ) -> Result<bool>;
}

/// Buckets shared between gateway instances through a [`BucketStore`].
pub struct SharedRateLimiter {
    store: Arc<dyn BucketStore>,
    max_cas_attempts: u32,
}

impl SharedRateLimiter {
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self {
            store,
            max_cas_attempts: 16,
        }
    }

    async fn update<R>(
        &self,
        key: &str,
        quota: RateQuota,
        f: impl Fn(&mut BucketState, i64) -> R + Send + Sync,
    ) -> Result<R> {
        for _ in 0..self.max_cas_attempts {
            let now = now_ms();
            let current = self.store.load(key).await?;
            let (mut state, expected) = match current {
                Some(v) => (v.state, Some(v.version)),
                None => (BucketState::full(quota, now), None),
            };
            let result = f(&mut state, now);
            if self.store.compare_and_swap(key, expected, state).await? {
                return Ok(result);
            }
            debug!(key, "Bucket CAS lost, retrying");
        }
        Err(Error::Unavailable(format!(
            "Rate limit bucket for {} is contended",
            key
        )))
    }
}

#[async_trait]
impl RateLimitBackend for SharedRateLimiter {
    async fn try_acquire(&self, key: &str, quota: RateQuota) -> Result<Option<Duration>> {
        self.update(key, quota, |bucket, now| bucket.try_acquire(quota, now))
            .await
    }

    async fn pause(&self, key: &str, quota: RateQuota, delay: Duration) -> Result<()> {
        let delay_ms = delay.as_millis() as i64;
        self.update(key, quota, |bucket, now| bucket.pause_until(now + delay_ms))
            .await
    }
}

/// In-process [`BucketStore`], standing in for a database table.
#[derive(Default)]
pub struct MemoryBucketStore {
    rows: Mutex<HashMap<String, VersionedBucket>>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn load(&self, key: &str) -> Result<Option<VersionedBucket>> {
        Ok(lock(&self.rows).get(key).copied())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: BucketState,
    ) -> Result<bool> {
        let mut rows = lock(&self.rows);
        let current = rows.get(key).map(|row| row.version);
        if current != expected {
            return Ok(false);
        }
        let version = current.map_or(1, |v| v + 1);
        rows.insert(key.to_string(), VersionedBucket { state, version });
        Ok(true)
    }
}

/// Admission and retry around adapter calls.
pub struct Governor {
    retry: RetryConfig,
    limiter: Arc<dyn RateLimitBackend>,
    default_quota: RateQuota,
}

impl Governor {
    pub fn new(retry: RetryConfig, limiter: Arc<dyn RateLimitBackend>, default_quota: RateQuota) -> Self {
        Self {
            retry,
            limiter,
            default_quota,
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Wait until the source's bucket admits one call.
    async fn admit(&self, key: &str, quota: RateQuota) -> Result<()> {
        while let Some(wait) = self.limiter.try_acquire(key, quota).await? {
            debug!(source = key, wait_ms = wait.as_millis() as u64, "Waiting for rate limit");
            sleep(wait).await;
        }
        Ok(())
    }

    /// Run an adapter call with admission control and retries.
    ///
    /// Only `Throttled`, `Unavailable` and network errors are retried. A
    /// provider `Retry-After` wins over the computed backoff, and a throttle
    /// also pauses the source's bucket so concurrent callers back off too.
    ///
    /// # Errors
    /// - Non-retryable errors immediately
    /// - `Throttled` or `Unavailable` once attempts are exhausted
    pub async fn execute<F, Fut, T>(
        &self,
        source_id: &SourceId,
        adapter: &dyn StorageAdapter,
        operation: &str,
        call: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = source_id.as_str();
        let quota = adapter.rate_quota().unwrap_or(self.default_quota);
        let mut attempt = 0;

        loop {
            self.admit(key, quota).await?;

            let err = match call().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(source = key, operation, "Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            attempt += 1;

            let hinted = err
                .retry_after()
                .or_else(|| adapter.rate_limit_signal().and_then(|s| s.remaining()));
            let delay = hinted.unwrap_or_else(|| self.retry.delay_for_attempt(attempt - 1));

            if matches!(err, Error::Throttled { .. }) {
                self.limiter.pause(key, quota, delay).await?;
            }

            if attempt >= self.retry.max_attempts {
                warn!(
                    source = key,
                    operation,
                    "Operation failed after {} attempts: {}",
                    attempt,
                    err
                );
                return Err(err.into_exhausted());
            }

            warn!(
                source = key,
                operation,
                "Attempt {} failed: {}. Retrying in {:?}...",
                attempt,
                err,
                delay
            );
            sleep(delay).await;
        }
    }
}
