// tests/pool_tests.rs

mod common;

use chrono::{TimeDelta, Utc};
use common::{pool_with_keys, test_key, used_key};
use futures::future::join_all;
use keypool::{AcquireOptions, KeyCache, KeyEntry, KeyStore, NotifyLevel};
use secrecy::SecretString;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn concurrent_reserving_acquires_get_distinct_keys() {
    let keys = (0..8).map(|i| test_key(&format!("key-{i}"))).collect();
    let harness = pool_with_keys(keys);

    let acquires = (0..8).map(|_| {
        let pool = harness.pool.clone();
        async move {
            let opts = AcquireOptions::default().reserve(Duration::from_secs(60));
            pool.acquire(&opts).await.unwrap()
        }
    });
    let results = join_all(acquires).await;

    let names: HashSet<String> = results
        .into_iter()
        .map(|entry| entry.expect("every caller should receive a key").name)
        .collect();
    assert_eq!(names.len(), 8, "no key may be delivered twice");
}

#[tokio::test]
async fn extra_callers_get_empty_not_an_error() {
    let harness = pool_with_keys(vec![test_key("only")]);

    let opts = AcquireOptions::default().reserve(Duration::from_secs(60));
    let first = harness.pool.acquire(&opts).await.unwrap();
    let second = harness.pool.acquire(&opts).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
}

#[tokio::test]
async fn exhausted_pool_returns_empty_and_notifies() {
    let mut key = test_key("spent");
    key.quota_exhausted = true;
    let harness = pool_with_keys(vec![key]);

    let result = harness.pool.acquire(&AcquireOptions::default()).await.unwrap();

    assert!(result.is_none());
    assert_eq!(harness.sink.count_at(NotifyLevel::Warning).await, 1);
}

#[tokio::test]
async fn selection_prefers_least_used_then_oldest() {
    let now = Utc::now();
    let a = used_key("a", 10, 0, Some(now));
    let b = used_key("b", 2, 0, Some(now));
    let c = used_key("c", 2, 0, Some(now - TimeDelta::hours(1)));
    let harness = pool_with_keys(vec![a, b, c]);

    let opts = AcquireOptions::default().reserve(Duration::from_secs(60));
    let mut order = Vec::new();
    while let Some(entry) = harness.pool.acquire(&opts).await.unwrap() {
        order.push(entry.name);
    }

    assert_eq!(order, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn allow_exhausted_widens_the_predicate() {
    let mut key = test_key("spent");
    key.quota_exhausted = true;
    let harness = pool_with_keys(vec![key]);

    assert!(harness
        .pool
        .acquire(&AcquireOptions::default())
        .await
        .unwrap()
        .is_none());

    let entry = harness
        .pool
        .acquire(&AcquireOptions::default().allow_exhausted())
        .await
        .unwrap();
    assert_eq!(entry.unwrap().name, "spent");
}

#[tokio::test]
async fn cooldown_expires_without_further_mutation() {
    let harness = pool_with_keys(vec![test_key("cooling")]);

    harness
        .pool
        .disable("cooling", Duration::from_millis(80))
        .await
        .unwrap();
    assert!(harness
        .pool
        .acquire(&AcquireOptions::default())
        .await
        .unwrap()
        .is_none());

    tokio::time::sleep(Duration::from_millis(120)).await;

    let entry = harness
        .pool
        .acquire(&AcquireOptions::default())
        .await
        .unwrap();
    assert_eq!(entry.unwrap().name, "cooling");
}

#[tokio::test]
async fn disable_invalidates_stale_cache_entries() {
    let harness = pool_with_keys(vec![test_key("hot")]);

    // Slow path populates the cache with the available snapshot.
    let first = harness
        .pool
        .acquire(&AcquireOptions::default())
        .await
        .unwrap();
    assert_eq!(first.unwrap().name, "hot");
    assert!(harness.cache.len().await.unwrap() > 0);

    harness
        .pool
        .disable("hot", Duration::from_secs(300))
        .await
        .unwrap();

    // The stale cached copy must not be served after the disable.
    let after = harness
        .pool
        .acquire(&AcquireOptions::default())
        .await
        .unwrap();
    assert!(after.is_none());
}

#[tokio::test]
async fn plain_acquire_pops_the_cache_first() {
    let harness = pool_with_keys(vec![test_key("stored")]);
    harness
        .cache
        .replace(vec![KeyEntry {
            name: "cached".to_string(),
            secret: SecretString::new("sk-cached".to_string()),
        }])
        .await
        .unwrap();

    let entry = harness
        .pool
        .acquire(&AcquireOptions::default())
        .await
        .unwrap();
    assert_eq!(entry.unwrap().name, "cached");
}

#[tokio::test]
async fn side_effects_bypass_the_cache() {
    let harness = pool_with_keys(vec![test_key("stored")]);
    harness
        .cache
        .replace(vec![KeyEntry {
            name: "cached".to_string(),
            secret: SecretString::new("sk-cached".to_string()),
        }])
        .await
        .unwrap();

    let entry = harness
        .pool
        .acquire(&AcquireOptions::default().mark_use())
        .await
        .unwrap();
    assert_eq!(entry.unwrap().name, "stored");

    let stored = harness.store.get_key("stored").await.unwrap().unwrap();
    assert_eq!(stored.daily_request_count, 1);
    assert!(stored.last_used.is_some());
}

#[tokio::test]
async fn slow_path_refills_the_cache_wholesale() {
    let keys = vec![test_key("a"), test_key("b"), test_key("c")];
    let harness = pool_with_keys(keys);

    let first = harness
        .pool
        .acquire(&AcquireOptions::default())
        .await
        .unwrap();
    assert!(first.is_some());

    // All three keys are still available, so the refill snapshot holds all
    // of them; claims are momentary and leave availability untouched.
    assert_eq!(harness.cache.len().await.unwrap(), 3);
}

#[tokio::test]
async fn release_refreshes_last_used() {
    let harness = pool_with_keys(vec![test_key("worker")]);

    harness.pool.release("worker").await.unwrap();

    let key = harness.store.get_key("worker").await.unwrap().unwrap();
    assert!(key.last_used.is_some());
}

#[tokio::test]
async fn releasing_unknown_key_is_an_error() {
    let harness = pool_with_keys(vec![]);
    let err = harness.pool.release("ghost").await.unwrap_err();
    assert!(err.to_string().contains("ghost"));
}
