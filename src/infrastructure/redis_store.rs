//! Redis-backed rate-limit and idempotency store.
//!
//! Lets multiple application instances share rate-limit state and idempotency
//! records through one Redis deployment.
//!
//! ## Data model
//!
//! - Sliding windows: a sorted set per key, scored by request time in
//!   milliseconds, expiring one window after the last admitted request.
//! - Token buckets: a hash per key with `tokens` and `ts` fields, expiring once
//!   the bucket would be full again.
//! - Idempotency records: bincode-encoded values with a millisecond TTL.
//!
//! Every rate-limit mutation runs as one Lua script, so read, prune, count and
//! conditional write are a single atomic step on the server. The caller's clock
//! supplies `now`, keeping all instances on the same time base as the
//! in-process fallback.
//!
//! ## Example
//!
//! ```rust,ignore
//! use booking_guard::infrastructure::redis_store::{RedisStore, RedisStoreConfig};
//! use booking_guard::RateLimiter;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = RedisStore::connect_with_config("redis://127.0.0.1/", RedisStoreConfig::default())
//!         .await
//!         .expect("Failed to connect to Redis");
//!
//!     let limiter = RateLimiter::builder()
//!         .with_remote(Arc::new(store))
//!         .build()
//!         .expect("valid limiter configuration");
//! }
//! ```

use crate::application::ports::{IdempotencyStore, RateLimitStore};
use crate::domain::idempotency::IdempotencyRecord;
use crate::domain::outcome::{RuleOutcome, RuleStatus};
use crate::domain::rule::{Algorithm, RateLimitRule, SlidingWindow, TokenBucket};
use crate::domain::window::{saturating_secs, SlidingWindowState, TokenBucketState};
use crate::error::BackendError;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// KEYS[1] = window set; ARGV = now_ms, window_ms, max, member.
/// Returns {allowed, remaining, retry_after_ms}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])

if count < max then
    redis.call('ZADD', KEYS[1], now, ARGV[4])
    redis.call('PEXPIRE', KEYS[1], window)
    return {1, max - count - 1, 0}
end

local retry = 0
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if oldest[2] then
    retry = math.max(0, tonumber(oldest[2]) + window - now)
end
return {0, 0, retry}
"#;

/// KEYS[1] = bucket hash; ARGV = now_ms, capacity, refill_per_sec, ttl_ms.
/// Returns {allowed, tokens, retry_after_secs} with floats as strings.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end

tokens = math.min(capacity, tokens + math.max(0, now - ts) / 1000 * rate)

if tokens + 1e-9 >= 1 then
    tokens = math.max(0, tokens - 1)
    redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(math.max(now, ts)))
    redis.call('PEXPIRE', KEYS[1], ARGV[4])
    return {1, tostring(tokens), '0'}
end

return {0, tostring(tokens), tostring((1 - tokens) / rate)}
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// Prefix for every key this store writes (default: "booking-guard:")
    pub key_prefix: String,
    /// Upper bound on a single command or script (default: 250 ms)
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "booking-guard:".to_string(),
            command_timeout: Duration::from_millis(250),
        }
    }
}

/// Redis-backed [`RateLimitStore`] and [`IdempotencyStore`].
///
/// Cloning is cheap; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    sliding_window: Script,
    token_bucket: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            config,
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    /// The store configuration.
    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Run `op` under the command timeout.
    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, BackendError> {
        match tokio::time::timeout(self.config.command_timeout, op).await {
            Ok(result) => result.map_err(backend_error),
            Err(_) => Err(BackendError::Timeout(self.config.command_timeout)),
        }
    }

    async fn window_entries(
        &self,
        key: &str,
        limit: &SlidingWindow,
        now: SystemTime,
    ) -> Result<SlidingWindowState, BackendError> {
        let mut conn = self.connection.clone();
        let key = self.key(key);
        let min = format!("({}", millis(now).saturating_sub(millis_of(limit.window())));

        let entries: Vec<(String, f64)> = self
            .bounded(async move {
                redis::cmd("ZRANGEBYSCORE")
                    .arg(&key)
                    .arg(min)
                    .arg("+inf")
                    .arg("WITHSCORES")
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(SlidingWindowState::from_entries(
            entries
                .into_iter()
                .map(|(_, score)| from_millis(score.max(0.0) as u64)),
        ))
    }

    async fn bucket_state(
        &self,
        key: &str,
        limit: &TokenBucket,
        now: SystemTime,
    ) -> Result<TokenBucketState, BackendError> {
        let mut conn = self.connection.clone();
        let key = self.key(key);

        let (tokens, ts): (Option<String>, Option<String>) = self
            .bounded(async move { conn.hget(&key, &["tokens", "ts"]).await })
            .await?;

        let parsed = tokens
            .zip(ts)
            .and_then(|(tokens, ts)| Some((tokens.parse::<f64>().ok()?, ts.parse::<f64>().ok()?)));
        Ok(match parsed {
            Some((tokens, ts)) => TokenBucketState::from_parts(tokens, from_millis(ts.max(0.0) as u64)),
            None => TokenBucketState::full(limit, now),
        })
    }
}

#[async_trait::async_trait]
impl RateLimitStore for RedisStore {
    async fn hit_sliding_window(
        &self,
        key: &str,
        limit: &SlidingWindow,
        now: SystemTime,
    ) -> Result<RuleOutcome, BackendError> {
        let mut conn = self.connection.clone();
        let now_ms = millis(now);
        let member = format!("{now_ms}-{:016x}", rand::random::<u64>());
        let mut invocation = self.sliding_window.key(self.key(key));
        invocation
            .arg(now_ms)
            .arg(millis_of(limit.window()))
            .arg(limit.max)
            .arg(member);

        let (allowed, remaining, retry_ms): (i64, i64, i64) = self
            .bounded(async move { invocation.invoke_async(&mut conn).await })
            .await?;

        Ok(if allowed == 1 {
            RuleOutcome::allowed(remaining.max(0) as u64)
        } else {
            RuleOutcome::denied(Duration::from_millis(retry_ms.max(0) as u64))
        })
    }

    async fn take_token(
        &self,
        key: &str,
        limit: &TokenBucket,
        now: SystemTime,
    ) -> Result<RuleOutcome, BackendError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.token_bucket.key(self.key(key));
        invocation
            .arg(millis(now))
            .arg(limit.capacity)
            .arg(limit.refill_rate_per_sec)
            .arg(expiry_millis(limit.full_refill()));

        let (allowed, tokens, retry_secs): (i64, String, String) = self
            .bounded(async move { invocation.invoke_async(&mut conn).await })
            .await?;

        let tokens = parse_float(&tokens)?;
        Ok(if allowed == 1 {
            RuleOutcome::allowed((tokens + 1e-9).floor().max(0.0) as u64)
        } else {
            RuleOutcome::denied(saturating_secs(parse_float(&retry_secs)?))
        })
    }

    async fn status(
        &self,
        key: &str,
        rule: &RateLimitRule,
        now: SystemTime,
    ) -> Result<RuleStatus, BackendError> {
        let label = rule.label();
        match &rule.algorithm {
            Algorithm::SlidingWindow(limit) => Ok(self
                .window_entries(key, limit, now)
                .await?
                .status(limit, label, now)),
            Algorithm::TokenBucket(limit) => Ok(self
                .bucket_state(key, limit, now)
                .await?
                .status(limit, label, now)),
        }
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}{}*", escape_glob(&self.config.key_prefix), escape_glob(prefix));

        let mut removed = 0;
        let mut cursor = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn),
                )
                .await?;

            if !keys.is_empty() {
                let deleted: usize = self.bounded(conn.del(&keys)).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let pong: String = self
            .bounded(async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(BackendError::Protocol(format!("unexpected PING reply {pong:?}")))
        }
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, BackendError> {
        let mut conn = self.connection.clone();
        let redis_key = self.key(key);

        let bytes: Option<Vec<u8>> = self.bounded(conn.get(&redis_key)).await?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };

        match bincode::deserialize::<IdempotencyRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Corrupted data, delete it
                tracing::warn!(error = %e, key = %redis_key, "discarding undecodable idempotency record");
                let _: () = self.bounded(conn.del(&redis_key)).await?;
                Ok(None)
            }
        }
    }

    async fn put(&self, record: IdempotencyRecord, ttl: Duration) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let key = self.key(&record.key);
        let bytes = encode_record(&record)?;

        self.bounded(conn.pset_ex(&key, bytes, expiry_millis(ttl)))
            .await
    }

    async fn put_if_absent(
        &self,
        record: IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut conn = self.connection.clone();
        let key = self.key(&record.key);
        let bytes = encode_record(&record)?;

        let reply: Option<String> = self
            .bounded(async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(bytes)
                    .arg("NX")
                    .arg("PX")
                    .arg(expiry_millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let key = self.key(key);
        self.bounded(conn.del(&key)).await
    }
}

fn backend_error(e: RedisError) -> BackendError {
    match e.kind() {
        redis::ErrorKind::TypeError => BackendError::Protocol(e.to_string()),
        _ => BackendError::Unavailable(e.to_string()),
    }
}

fn encode_record(record: &IdempotencyRecord) -> Result<Vec<u8>, BackendError> {
    bincode::serialize(record).map_err(|e| BackendError::Protocol(e.to_string()))
}

fn parse_float(raw: &str) -> Result<f64, BackendError> {
    raw.parse()
        .map_err(|_| BackendError::Protocol(format!("expected a number, got {raw:?}")))
}

fn millis(t: SystemTime) -> u64 {
    millis_of(t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO))
}

fn millis_of(d: Duration) -> u64 {
    d.as_millis().try_into().unwrap_or(u64::MAX)
}

/// Longest expiry sent to `PEXPIRE`/`SET PX`; Redis rejects values near `i64::MAX`.
const MAX_EXPIRY_MS: u64 = 1 << 52;

fn expiry_millis(d: Duration) -> u64 {
    millis_of(d).clamp(1, MAX_EXPIRY_MS)
}

fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// Escape Redis glob metacharacters so `s` matches literally in `SCAN MATCH`.
fn escape_glob(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
