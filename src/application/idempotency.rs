//! Execute-once wrapper keyed by caller-supplied idempotency keys.
//!
//! A `Completed` record is written only after the wrapped operation returns
//! `Ok`, so the absence of one always means the operation has not durably
//! succeeded and may be retried.
//!
//! Results are stored as JSON so any `Serialize + DeserializeOwned` type
//! replays, including `serde_json::Value`, tagged enums and structs with
//! skipped fields.

use crate::application::ports::{Clock, IdempotencyStore};
use crate::domain::idempotency::{self, IdempotencyRecord};
use crate::error::Error;
use crate::infrastructure::clock::SystemClock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the idempotency guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Lifetime of a `Completed` record (default: 24 hours)
    pub record_ttl: Duration,
    /// Lifetime of the `Pending` marker taken by exclusive execution (default: 30 s)
    pub lock_ttl: Duration,
    /// Namespace for stored records (default: "idempotency:")
    pub key_prefix: String,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(24 * 60 * 60),
            lock_ttl: Duration::from_secs(30),
            key_prefix: "idempotency:".to_string(),
        }
    }
}

/// Result of a guarded execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution<T> {
    /// Whether the operation ran during this call
    pub was_executed: bool,
    /// The operation's result, fresh or replayed
    pub result: T,
}

/// Deduplicates side-effecting operations per idempotency key.
///
/// [`execute`](Self::execute) does not exclude concurrent first calls: two
/// callers that both find no record will both run the operation.
/// [`execute_exclusive`](Self::execute_exclusive) closes that window with a
/// short-lived `Pending` marker.
///
/// # Example
/// ```
/// use booking_guard::{generate_key, IdempotencyGuard, MemoryIdempotencyStore};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), booking_guard::Error> {
/// let guard = IdempotencyGuard::new(Arc::new(MemoryIdempotencyStore::new()));
/// let key = generate_key(&["refund", "123", "pi_abc"]);
///
/// let first = guard.execute(&key, || async { Ok::<_, booking_guard::Error>(4200u64) }).await?;
/// let second = guard.execute(&key, || async { Ok::<_, booking_guard::Error>(0u64) }).await?;
///
/// assert!(first.was_executed);
/// assert!(!second.was_executed);
/// assert_eq!(second.result, 4200);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    /// Guard over `store` with default configuration.
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self::with_config(store, IdempotencyConfig::default())
    }

    /// Guard over `store` with `config`.
    pub fn with_config(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock::new()),
            config,
        }
    }

    /// Use `clock` to timestamp records.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The guard configuration.
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Join identifying components into a key. See [`generate_key`](crate::generate_key).
    pub fn generate_key<S: AsRef<str>>(parts: &[S]) -> String {
        idempotency::generate_key(parts)
    }

    /// Run `operation` unless it already completed for `key`.
    ///
    /// A stored result is replayed without invoking `operation`. If
    /// `operation` fails nothing is stored and the error is returned, so the
    /// next call runs it again. A `Pending` marker left by
    /// [`execute_exclusive`](Self::execute_exclusive) is ignored.
    ///
    /// # Errors
    /// Returns the operation's error, or a store or codec failure while
    /// looking up a previous result.
    pub async fn execute<T, E, F, Fut>(&self, key: &str, operation: F) -> Result<Execution<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let record_key = self.record_key(key);
        if let Some(result) = self.replay(&record_key).await? {
            return Ok(Execution {
                was_executed: false,
                result,
            });
        }

        let result = operation().await?;
        self.store_completed(&record_key, &result).await;
        Ok(Execution {
            was_executed: true,
            result,
        })
    }

    /// Like [`execute`](Self::execute), but concurrent first calls are
    /// mutually excluded.
    ///
    /// A `Pending` marker is set only if no record exists, with `lock_ttl`
    /// as its lifetime. A caller that finds the marker fails fast with
    /// `Error::InProgress`. Success replaces the marker with the `Completed`
    /// record; failure removes it so a retry starts fresh. If the caller is
    /// cancelled mid-operation the marker lingers until `lock_ttl` elapses.
    ///
    /// # Errors
    /// `Error::InProgress` while another call holds the key, otherwise as
    /// [`execute`](Self::execute).
    pub async fn execute_exclusive<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<Execution<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let record_key = self.record_key(key);
        if let Some(result) = self.replay(&record_key).await? {
            return Ok(Execution {
                was_executed: false,
                result,
            });
        }

        let marker = IdempotencyRecord::pending(record_key.as_str(), self.clock.now());
        let claimed = self
            .store
            .put_if_absent(marker, self.config.lock_ttl)
            .await
            .map_err(Error::from)?;
        if !claimed {
            // Either still running elsewhere, or it finished in between.
            if let Some(result) = self.replay(&record_key).await? {
                return Ok(Execution {
                    was_executed: false,
                    result,
                });
            }
            return Err(Error::InProgress {
                key: key.to_string(),
            }
            .into());
        }

        match operation().await {
            Ok(result) => {
                self.store_completed(&record_key, &result).await;
                Ok(Execution {
                    was_executed: true,
                    result,
                })
            }
            Err(e) => {
                if let Err(remove_err) = self.store.remove(&record_key).await {
                    tracing::warn!(
                        error = %remove_err,
                        key,
                        "failed to release idempotency marker; it expires with the lock TTL"
                    );
                }
                Err(e)
            }
        }
    }

    /// Whether a `Completed` record exists for `key`.
    pub async fn was_completed(&self, key: &str) -> Result<bool, Error> {
        let record = self.store.get(&self.record_key(key)).await?;
        Ok(record.is_some_and(|record| record.is_completed()))
    }

    /// The stored result for `key`, if the operation completed.
    pub async fn get_result<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        self.replay(&self.record_key(key)).await
    }

    /// Remove the record for `key`, permitting re-execution.
    pub async fn clear(&self, key: &str) -> Result<(), Error> {
        self.store.remove(&self.record_key(key)).await?;
        tracing::debug!(key, "cleared idempotency record");
        Ok(())
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn replay<T: DeserializeOwned>(&self, record_key: &str) -> Result<Option<T>, Error> {
        match self.store.get(record_key).await? {
            Some(record) if record.is_completed() => {
                tracing::trace!(key = record_key, "replaying stored idempotent result");
                Ok(Some(serde_json::from_slice(&record.result)?))
            }
            _ => Ok(None),
        }
    }

    /// Persist a successful result.
    ///
    /// The operation already took effect, so a failure here is logged rather
    /// than returned; the next call with this key runs the operation again.
    async fn store_completed<T: Serialize>(&self, record_key: &str, result: &T) {
        let bytes = match serde_json::to_vec(result) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, key = record_key, "failed to encode idempotent result");
                return;
            }
        };
        let record = IdempotencyRecord::completed(record_key, bytes, self.clock.now());
        if let Err(e) = self.store.put(record, self.config.record_ttl).await {
            tracing::error!(error = %e, key = record_key, "failed to store idempotent result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_idempotency::MemoryIdempotencyStore;
    use crate::infrastructure::mocks::MockClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn guard() -> (IdempotencyGuard, MockClock) {
        let clock = MockClock::default();
        let store = MemoryIdempotencyStore::with_clock(Arc::new(clock.clone()));
        (
            IdempotencyGuard::new(Arc::new(store)).with_clock(Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn test_runs_once() {
        let (guard, _) = guard();
        let calls = AtomicU32::new(0);

        for expected in [true, false, false] {
            let execution = guard
                .execute("booking:42", || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(format!("result-{n}"))
                })
                .await
                .unwrap();
            assert_eq!(execution.was_executed, expected);
            assert_eq!(execution.result, "result-0");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_leaves_no_record() {
        let (guard, _) = guard();

        let err = guard
            .execute("k", || async { Err::<u32, _>(Error::rejected("card declined")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert!(!guard.was_completed("k").await.unwrap());

        let retry = guard.execute("k", || async { Ok::<_, Error>(7u32) }).await.unwrap();
        assert!(retry.was_executed);
        assert_eq!(guard.get_result::<u32>("k").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_clear_permits_rerun() {
        let (guard, _) = guard();
        guard.execute("k", || async { Ok::<_, Error>(1u8) }).await.unwrap();
        guard.clear("k").await.unwrap();

        let again = guard.execute("k", || async { Ok::<_, Error>(2u8) }).await.unwrap();
        assert!(again.was_executed);
        assert_eq!(again.result, 2);
    }

    #[tokio::test]
    async fn test_record_expires() {
        let (guard, clock) = guard();
        guard.execute("k", || async { Ok::<_, Error>(1u8) }).await.unwrap();

        clock.advance(guard.config().record_ttl);
        assert!(!guard.was_completed("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_exclusive_rejects_concurrent_holder() {
        let (guard, clock) = guard();
        let store = Arc::clone(&guard.store);
        store
            .put_if_absent(
                IdempotencyRecord::pending("idempotency:k", clock.now()),
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        let err = guard
            .execute_exclusive("k", || async { Ok::<_, Error>(1u8) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InProgress { key } if key == "k"));

        // The plain variant ignores the marker
        assert!(guard
            .execute("k", || async { Ok::<_, Error>(1u8) })
            .await
            .unwrap()
            .was_executed);
    }

    #[tokio::test]
    async fn test_exclusive_failure_releases_marker() {
        let (guard, _) = guard();
        guard
            .execute_exclusive("k", || async { Err::<u8, _>(Error::rejected("nope")) })
            .await
            .unwrap_err();

        let retry = guard
            .execute_exclusive("k", || async { Ok::<_, Error>(3u8) })
            .await
            .unwrap();
        assert!(retry.was_executed);
        assert!(guard.was_completed("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_replays_self_describing_results() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "kind", rename_all = "snake_case")]
        enum Outcome {
            Booked { room: String },
            Waitlisted,
        }

        let (guard, _) = guard();

        let value = serde_json::json!({"booking": "b-1", "nights": 3});
        let first = guard
            .execute("json", || async { Ok::<_, Error>(value.clone()) })
            .await
            .unwrap();
        let second = guard
            .execute("json", || async { Ok::<_, Error>(serde_json::Value::Null) })
            .await
            .unwrap();
        assert!(first.was_executed);
        assert!(!second.was_executed);
        assert_eq!(second.result, value);

        let booked = Outcome::Booked {
            room: "r7".to_string(),
        };
        guard
            .execute("tagged", || async {
                Ok::<_, Error>(Outcome::Booked {
                    room: "r7".to_string(),
                })
            })
            .await
            .unwrap();
        let replay = guard
            .execute("tagged", || async { Ok::<_, Error>(Outcome::Waitlisted) })
            .await
            .unwrap();
        assert!(!replay.was_executed);
        assert_eq!(replay.result, booked);
        assert_eq!(guard.get_result::<Outcome>("tagged").await.unwrap(), Some(booked));
    }

    #[test]
    fn test_generate_key() {
        assert_eq!(IdempotencyGuard::generate_key(&["a", "b"]), "a:b");
    }
}
