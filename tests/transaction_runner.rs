use booking_guard::{
    BackoffPolicy, Error, ErrorClass, ErrorClassifier, Fields, IsolationLevel, MemoryDatabase,
    Record, RunOptions, StoreError, TransactionFailure, TransactionRunner,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("booking_guard=debug")
        .with_test_writer()
        .try_init();
}

fn runner(db: &MemoryDatabase) -> TransactionRunner<MemoryDatabase> {
    TransactionRunner::new(Arc::new(db.clone())).with_backoff(BackoffPolicy::none())
}

fn counter(value: i64) -> Fields {
    json!({ "value": value }).as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_failed_attempts_leave_no_trace() {
    init_tracing();
    let db = MemoryDatabase::new();
    let runner = runner(&db);
    let attempts = AtomicU32::new(0);

    let result = runner
        .serializable("allocate slot", |tx| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tx.insert("slots", Record::new(format!("slot-{attempt}"), Fields::new()))
                    .await?;
                if attempt <= 2 {
                    return Err(Error::Store(StoreError::serialization_failure()));
                }
                Ok(format!("slot-{attempt}"))
            }
        })
        .await
        .unwrap();

    assert_eq!(result, "slot-3");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(db.row_count("slots"), 1);
    assert!(db.get("slots", "slot-1").is_none());
    assert!(db.get("slots", "slot-2").is_none());
}

#[tokio::test]
async fn test_business_error_propagates_immediately() {
    let db = MemoryDatabase::new();
    let runner = runner(&db);
    let attempts = AtomicU32::new(0);

    let err = runner
        .repeatable_read("refund", |_tx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::rejected("refund window closed")) }
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "refund window closed");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exhausted_retries_surface_the_conflict() {
    init_tracing();
    let db = MemoryDatabase::new();
    let runner = runner(&db);

    let err = runner
        .run_with(IsolationLevel::Serializable, RunOptions::named("book"), |_tx| async {
            Err::<(), _>(Error::Store(StoreError::deadlock()))
        })
        .await
        .unwrap_err();

    let cause = err.store_error().expect("store error preserved");
    assert_eq!(cause.code(), Some("40P01"));
    assert_eq!(db.rollbacks(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_between_attempts() {
    let db = MemoryDatabase::new();
    let runner = TransactionRunner::new(Arc::new(db.clone())).with_backoff(BackoffPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        jitter: 0.0,
    });

    let started = tokio::time::Instant::now();
    let _ = runner
        .run(|_tx| async { Err::<(), _>(Error::Store(StoreError::serialization_failure())) })
        .await;

    // 100ms after the first attempt, 200ms after the second.
    assert_eq!(started.elapsed(), Duration::from_millis(300));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_serialized() {
    const WRITERS: u32 = 8;

    let db = MemoryDatabase::new();
    db.seed("counters", Record::new("c", counter(0)));
    let runner = runner(&db);

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .serializable(RunOptions::named("increment").with_max_attempts(WRITERS), |tx| async move {
                        let row = tx.fetch("counters", "c").await?.expect("seeded");
                        let value = row.fields["value"].as_i64().unwrap_or_default();
                        tokio::task::yield_now().await;
                        let affected = tx
                            .conditional_update(
                                "counters",
                                "c",
                                &counter(value + 1),
                                Some(row.effective_version()),
                            )
                            .await?;
                        if affected == 0 {
                            // Someone committed since our read.
                            return Err(Error::Store(StoreError::serialization_failure()));
                        }
                        Ok::<_, Error>(())
                    })
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let row = db.get("counters", "c").unwrap();
    assert_eq!(row.fields["value"], json!(WRITERS));
    assert_eq!(row.version, Some(1 + u64::from(WRITERS)));
}

#[tokio::test]
async fn test_nested_runs_share_one_commit() {
    let db = MemoryDatabase::new();
    let runner = runner(&db);
    let inner = runner.clone();

    runner
        .serializable("book", |tx| {
            let inner = inner.clone();
            async move {
                tx.insert("bookings", Record::new("b1", Fields::new())).await?;
                inner
                    .run(|tx| async move {
                        tx.insert("payments", Record::new("p1", Fields::new())).await?;
                        // The outer write is visible through the joined transaction.
                        assert!(tx.fetch("bookings", "b1").await?.is_some());
                        Ok::<_, Error>(())
                    })
                    .await
            }
        })
        .await
        .unwrap();

    assert_eq!(db.commits(), 1);
    assert_eq!(db.row_count("bookings"), 1);
    assert_eq!(db.row_count("payments"), 1);
}

#[tokio::test]
async fn test_nested_failure_rolls_back_outer() {
    let db = MemoryDatabase::new();
    let runner = runner(&db);
    let inner = runner.clone();

    let err = runner
        .run(|tx| {
            let inner = inner.clone();
            async move {
                tx.insert("bookings", Record::new("b1", Fields::new())).await?;
                inner
                    .run(|_tx| async { Err::<(), _>(Error::rejected("card declined")) })
                    .await
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Rejected(_)));
    assert_eq!(db.row_count("bookings"), 0);
    assert_eq!(db.rollbacks(), 1);
}

#[tokio::test]
async fn test_spawned_work_does_not_inherit_transaction() {
    let db = MemoryDatabase::new();
    let runner = runner(&db);
    let detached = runner.clone();

    let err = runner
        .run(|_tx| {
            let detached = detached.clone();
            async move {
                tokio::spawn(async move {
                    detached
                        .run(|tx| async move {
                            tx.insert("audit", Record::new("a1", Fields::new())).await?;
                            Ok::<_, Error>(())
                        })
                        .await
                })
                .await
                .expect("task completes")?;
                Err::<(), _>(Error::rejected("abort"))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Rejected(_)));
    assert_eq!(db.row_count("audit"), 1);
}

/// Application error carrying an optional store cause.
#[derive(Debug)]
enum BookingError {
    Store(StoreError),
    SoldOut,
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        BookingError::Store(e)
    }
}

impl TransactionFailure for BookingError {
    fn store_error(&self) -> Option<&StoreError> {
        match self {
            BookingError::Store(e) => Some(e),
            BookingError::SoldOut => None,
        }
    }
}

#[derive(Debug)]
struct LockTimeoutsOnly;

impl ErrorClassifier for LockTimeoutsOnly {
    fn classify(&self, error: &StoreError) -> ErrorClass {
        if error.code() == Some("55P03") {
            ErrorClass::Retryable
        } else {
            ErrorClass::Fatal
        }
    }
}

#[tokio::test]
async fn test_custom_error_and_classifier() {
    let db = MemoryDatabase::new();
    let runner = runner(&db).with_classifier(Arc::new(LockTimeoutsOnly));
    let attempts = AtomicU32::new(0);

    let result = runner
        .run(|_tx| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                match attempt {
                    0 => Err(BookingError::Store(StoreError::with_code(
                        "55P03",
                        "lock not available",
                    ))),
                    1 => Err(BookingError::SoldOut),
                    _ => Ok(()),
                }
            }
        })
        .await;

    assert!(matches!(result, Err(BookingError::SoldOut)));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // The default classifier's codes mean nothing to this one.
    let err = runner
        .run(|_tx| async { Err::<(), _>(BookingError::Store(StoreError::deadlock())) })
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Store(_)));
    assert_eq!(db.rollbacks(), 3);
}
