//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keypool::{
    InMemoryCache, InMemoryStore, Key, KeyPool, NotificationSink, NotifyLevel,
};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Sink that records every notification for later assertions.
pub struct RecordingSink {
    pub notifications: Mutex<Vec<(String, NotifyLevel)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            notifications: Mutex::new(Vec::new()),
        }
    }

    pub async fn count_at(&self, level: NotifyLevel) -> usize {
        self.notifications
            .lock()
            .await
            .iter()
            .filter(|(_, l)| *l == level)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, message: &str, level: NotifyLevel) {
        self.notifications
            .lock()
            .await
            .push((message.to_string(), level));
    }
}

pub fn test_key(name: &str) -> Key {
    Key {
        name: name.to_string(),
        secret: SecretString::new(format!("sk-{name}-0123456789abcdef")),
        daily_request_count: 0,
        daily_token_total: 0,
        last_used: None,
        disabled_until: None,
        quota_exhausted: false,
        quota_warning_sent: false,
    }
}

pub fn used_key(name: &str, count: i64, tokens: i64, last_used: Option<DateTime<Utc>>) -> Key {
    let mut key = test_key(name);
    key.daily_request_count = count;
    key.daily_token_total = tokens;
    key.last_used = last_used;
    key
}

pub struct TestPool {
    pub pool: KeyPool,
    pub store: Arc<InMemoryStore>,
    pub cache: Arc<InMemoryCache>,
    pub sink: Arc<RecordingSink>,
}

pub fn pool_with_keys(keys: Vec<Key>) -> TestPool {
    let store = Arc::new(InMemoryStore::new(keys));
    let cache = Arc::new(InMemoryCache::new());
    let sink = Arc::new(RecordingSink::new());
    let pool = KeyPool::new(store.clone(), cache.clone(), sink.clone());
    TestPool {
        pool,
        store,
        cache,
        sink,
    }
}
