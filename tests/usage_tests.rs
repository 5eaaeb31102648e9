// tests/usage_tests.rs

mod common;

use common::{pool_with_keys, test_key, used_key};
use keypool::{
    AcquireOptions, KeyCache, KeyEntry, KeyStore, NotifyLevel, QuotaLimits, UsageTracker,
};
use secrecy::SecretString;

fn tracker_for(harness: &common::TestPool) -> UsageTracker {
    UsageTracker::new(
        harness.pool.clone(),
        harness.sink.clone(),
        QuotaLimits::default(),
    )
}

#[tokio::test]
async fn record_updates_counters_and_audit_log() {
    let harness = pool_with_keys(vec![test_key("worker")]);
    let tracker = tracker_for(&harness);

    let outcome = tracker
        .record("worker", "task-1", 1500, "agentic")
        .await
        .unwrap();

    assert_eq!(outcome.key.daily_request_count, 1);
    assert_eq!(outcome.key.daily_token_total, 1500);
    assert!(outcome.key.last_used.is_some());
    assert!(!outcome.crossed_warning);
    assert!(!outcome.crossed_limit);

    let entries = harness.store.usage_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key_name, "worker");
    assert_eq!(entries[0].task, "task-1");
    assert_eq!(entries[0].token_count, 1500);
    assert_eq!(entries[0].request_type, "agentic");
}

#[tokio::test]
async fn token_totals_accumulate_across_records() {
    let harness = pool_with_keys(vec![test_key("worker")]);
    let tracker = tracker_for(&harness);

    tracker.record("worker", "t", 100, "cli").await.unwrap();
    tracker.record("worker", "t", 250, "cli").await.unwrap();
    let outcome = tracker.record("worker", "t", 50, "cli").await.unwrap();

    assert_eq!(outcome.key.daily_request_count, 3);
    assert_eq!(outcome.key.daily_token_total, 400);
    assert_eq!(harness.store.usage_entries().await.len(), 3);
}

#[tokio::test]
async fn crossing_the_limit_sets_the_sticky_flag() {
    let harness = pool_with_keys(vec![used_key("busy", 59, 0, None)]);
    let tracker = tracker_for(&harness);

    let outcome = tracker.record("busy", "t", 10, "cli").await.unwrap();

    assert!(outcome.crossed_limit);
    assert_eq!(outcome.key.daily_request_count, 60);
    assert!(outcome.key.quota_exhausted);
    assert_eq!(harness.sink.count_at(NotifyLevel::Error).await, 1);

    // Sticky: the exhausted key is excluded even though disabled_until is
    // unset, and opt-in widens the predicate again.
    let stored = harness.store.get_key("busy").await.unwrap().unwrap();
    assert!(stored.disabled_until.is_none());
    assert!(harness
        .pool
        .acquire(&AcquireOptions::default())
        .await
        .unwrap()
        .is_none());
    assert!(harness
        .pool
        .acquire(&AcquireOptions::default().allow_exhausted())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn exhaustion_fires_once_and_invalidates_the_cache() {
    let harness = pool_with_keys(vec![used_key("busy", 59, 0, None)]);
    harness
        .cache
        .replace(vec![KeyEntry {
            name: "busy".to_string(),
            secret: SecretString::new("sk-busy".to_string()),
        }])
        .await
        .unwrap();
    let tracker = tracker_for(&harness);

    tracker.record("busy", "t", 0, "cli").await.unwrap();
    assert_eq!(harness.cache.len().await.unwrap(), 0);

    // Further records stay above the limit but must not re-fire.
    tracker.record("busy", "t", 0, "cli").await.unwrap();
    tracker.record("busy", "t", 0, "cli").await.unwrap();
    assert_eq!(harness.sink.count_at(NotifyLevel::Error).await, 1);
}

#[tokio::test]
async fn near_quota_warning_fires_at_most_once_per_crossing() {
    let harness = pool_with_keys(vec![used_key("warming", 54, 0, None)]);
    let tracker = tracker_for(&harness);

    let outcome = tracker.record("warming", "t", 0, "cli").await.unwrap();
    assert!(outcome.crossed_warning);
    assert_eq!(outcome.key.daily_request_count, 55);

    // Still above the threshold on every subsequent call; the latch must
    // hold.
    for _ in 0..3 {
        let outcome = tracker.record("warming", "t", 0, "cli").await.unwrap();
        assert!(!outcome.crossed_warning);
    }
    assert_eq!(harness.sink.count_at(NotifyLevel::Warning).await, 1);
}

#[tokio::test]
async fn limit_crossing_suppresses_the_warning() {
    // 59 -> 60 crosses the warning band and the limit in one step; only the
    // exhaustion notification may fire.
    let harness = pool_with_keys(vec![used_key("busy", 59, 0, None)]);
    let tracker = tracker_for(&harness);

    let outcome = tracker.record("busy", "t", 0, "cli").await.unwrap();

    assert!(outcome.crossed_limit);
    assert!(!outcome.crossed_warning);
    assert_eq!(harness.sink.count_at(NotifyLevel::Warning).await, 0);
    assert_eq!(harness.sink.count_at(NotifyLevel::Error).await, 1);
}

#[tokio::test]
async fn recording_unknown_key_is_an_error() {
    let harness = pool_with_keys(vec![]);
    let tracker = tracker_for(&harness);

    let err = tracker.record("ghost", "t", 0, "cli").await.unwrap_err();
    assert!(err.to_string().contains("ghost"));
}
