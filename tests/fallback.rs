use booking_guard::infrastructure::mocks::{FlakyStore, MockClock};
use booking_guard::{HealthConfig, HealthState, RateLimitRule, RateLimiter, ServedBy};
use std::sync::Arc;
use std::time::Duration;

fn limiter(remote: &FlakyStore, clock: &MockClock) -> RateLimiter {
    RateLimiter::builder()
        .with_remote(Arc::new(remote.clone()))
        .with_clock(Arc::new(clock.clone()))
        .build()
        .unwrap()
}

fn per_minute(max: u64) -> [RateLimitRule; 1] {
    [RateLimitRule::sliding_window(max, 60).unwrap()]
}

#[tokio::test]
async fn test_remote_serves_while_healthy() {
    let remote = FlakyStore::new();
    let clock = MockClock::default();
    let limiter = limiter(&remote, &clock);
    let rules = per_minute(2);

    assert!(limiter.check("K", &rules).await.unwrap().allowed);
    assert!(limiter.check("K", &rules).await.unwrap().allowed);
    assert!(!limiter.check("K", &rules).await.unwrap().allowed);

    assert_eq!(remote.calls(), 3);
    assert_eq!(remote.backing().len(), 1);
    assert_eq!(limiter.metrics().fallback_checks(), 0);
    assert_eq!(limiter.health(), HealthState::Healthy);

    let status = limiter.status("K", &rules).await.unwrap();
    assert_eq!(status.served_by, ServedBy::Remote);
    assert_eq!(status.rules[0].used, 2);
}

#[tokio::test]
async fn test_outage_falls_back_and_sticks() {
    let remote = FlakyStore::new();
    remote.go_down();
    let clock = MockClock::default();
    let limiter = limiter(&remote, &clock);
    let rules = per_minute(2);

    assert!(limiter.check("K", &rules).await.unwrap().allowed);
    assert_eq!(limiter.health(), HealthState::Degraded);
    assert_eq!(remote.calls(), 1);

    // Degraded is sticky: no more remote calls, even once the store is back.
    remote.come_back();
    assert!(limiter.check("K", &rules).await.unwrap().allowed);
    assert!(!limiter.check("K", &rules).await.unwrap().allowed);
    assert_eq!(remote.calls(), 1);

    let snapshot = limiter.metrics().snapshot();
    assert_eq!(snapshot.backend_failures, 1);
    assert_eq!(snapshot.fallback_checks, 3);

    let status = limiter.status("K", &rules).await.unwrap();
    assert_eq!(status.served_by, ServedBy::Local);
    assert_eq!(status.rules[0].used, 2);
}

#[tokio::test]
async fn test_probe_restores_remote() {
    let remote = FlakyStore::new();
    remote.go_down();
    let clock = MockClock::default();
    let limiter = limiter(&remote, &clock);
    let rules = per_minute(5);

    limiter.check("K", &rules).await.unwrap();
    assert_eq!(limiter.health(), HealthState::Degraded);

    assert!(!limiter.probe_backend().await);
    assert_eq!(limiter.health(), HealthState::Degraded);

    remote.come_back();
    assert!(limiter.probe_backend().await);
    assert_eq!(limiter.health(), HealthState::Healthy);

    let calls = remote.calls();
    limiter.check("K", &rules).await.unwrap();
    assert_eq!(remote.calls(), calls + 1);
}

#[tokio::test]
async fn test_reprobe_after_interval() {
    let remote = FlakyStore::new();
    remote.go_down();
    let clock = MockClock::default();
    let limiter = RateLimiter::builder()
        .with_remote(Arc::new(remote.clone()))
        .with_clock(Arc::new(clock.clone()))
        .with_health_config(HealthConfig {
            failure_threshold: 1,
            reprobe_after: Some(Duration::from_secs(10)),
        })
        .build()
        .unwrap();
    let rules = per_minute(100);

    limiter.check("K", &rules).await.unwrap();
    assert_eq!(limiter.health(), HealthState::Degraded);

    clock.advance(Duration::from_secs(5));
    limiter.check("K", &rules).await.unwrap();
    assert_eq!(remote.calls(), 1);

    // Trial call fails: back to degraded.
    clock.advance(Duration::from_secs(5));
    limiter.check("K", &rules).await.unwrap();
    assert_eq!(remote.calls(), 2);
    assert_eq!(limiter.health(), HealthState::Degraded);

    // Trial call succeeds: healthy again.
    remote.come_back();
    clock.advance(Duration::from_secs(10));
    limiter.check("K", &rules).await.unwrap();
    assert_eq!(remote.calls(), 3);
    assert_eq!(limiter.health(), HealthState::Healthy);
}

#[tokio::test]
async fn test_failure_threshold() {
    let remote = FlakyStore::new();
    remote.go_down();
    let clock = MockClock::default();
    let limiter = RateLimiter::builder()
        .with_remote(Arc::new(remote.clone()))
        .with_clock(Arc::new(clock.clone()))
        .with_health_config(HealthConfig {
            failure_threshold: 3,
            reprobe_after: None,
        })
        .build()
        .unwrap();
    let rules = per_minute(100);

    for _ in 0..2 {
        limiter.check("K", &rules).await.unwrap();
        assert_eq!(limiter.health(), HealthState::Healthy);
    }
    limiter.check("K", &rules).await.unwrap();
    assert_eq!(limiter.health(), HealthState::Degraded);
    assert_eq!(remote.failures(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_remote_times_out_into_fallback() {
    let remote = FlakyStore::new();
    remote.set_latency(Some(Duration::from_secs(5)));
    let clock = MockClock::default();
    let limiter = RateLimiter::builder()
        .with_remote(Arc::new(remote.clone()))
        .with_clock(Arc::new(clock.clone()))
        .with_remote_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let rules = per_minute(1);

    let started = tokio::time::Instant::now();
    assert!(limiter.check("K", &rules).await.unwrap().allowed);
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(limiter.health(), HealthState::Degraded);
    assert_eq!(limiter.metrics().backend_failures(), 1);
    assert_eq!(remote.backing().len(), 0);
    assert!(!limiter.check("K", &rules).await.unwrap().allowed);
}

#[tokio::test]
async fn test_reset_clears_both_stores() {
    let remote = FlakyStore::new();
    let clock = MockClock::default();
    let limiter = limiter(&remote, &clock);
    let rules = per_minute(1);

    limiter.check("K", &rules).await.unwrap();
    assert_eq!(remote.backing().len(), 1);

    limiter.reset("K").await;
    assert!(remote.backing().is_empty());
    assert!(limiter.check("K", &rules).await.unwrap().allowed);
}
