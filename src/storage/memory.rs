// src/storage/memory.rs

use crate::error::{PoolError, Result};
use crate::storage::key::{
    selection_order, AcquireOptions, Key, KeyEntry, QuotaLimits, UsageLogEntry, UsageOutcome,
};
use crate::storage::traits::KeyStore;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

struct Inner {
    keys: HashMap<String, Key>,
    usage_log: Vec<UsageLogEntry>,
}

/// In-memory implementation of the key store.
///
/// A single async mutex plays the role of row locks: the availability read
/// and the claim side effects happen under one guard, which gives the same
/// observable contract as the SQL claim-and-skip query for in-process
/// callers. Used by the test suite and for cache-less experimentation.
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new(keys: Vec<Key>) -> Self {
        let keys = keys.into_iter().map(|k| (k.name.clone(), k)).collect();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                keys,
                usage_log: Vec::new(),
            })),
        }
    }

    pub async fn insert_key(&self, key: Key) {
        let mut inner = self.inner.lock().await;
        inner.keys.insert(key.name.clone(), key);
    }

    /// Copy of the append-only audit trail, oldest first.
    pub async fn usage_entries(&self) -> Vec<UsageLogEntry> {
        self.inner.lock().await.usage_log.clone()
    }
}

fn cooldown_delta(cooldown: Duration) -> TimeDelta {
    TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::MAX)
}

#[async_trait]
impl KeyStore for InMemoryStore {
    async fn select_key(&self, opts: &AcquireOptions) -> Result<Option<Key>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let mut candidates: Vec<&Key> = inner
            .keys
            .values()
            .filter(|k| k.is_available_at(now, opts.allow_exhausted))
            .collect();
        candidates.sort_by(|a, b| selection_order(a, b));

        let Some(selected) = candidates.first().map(|k| (*k).clone()) else {
            trace!("InMemoryStore::select_key: no candidate matched");
            return Ok(None);
        };

        if let Some(key) = inner.keys.get_mut(&selected.name) {
            if opts.mark_use {
                key.daily_request_count += 1;
                key.last_used = Some(now);
            }
            if let Some(window) = opts.reserve {
                key.disabled_until = Some(now + cooldown_delta(window));
            }
        }

        Ok(Some(selected))
    }

    async fn list_available(&self) -> Result<Vec<KeyEntry>> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let mut available: Vec<&Key> = inner
            .keys
            .values()
            .filter(|k| k.is_available_at(now, false))
            .collect();
        available.sort_by(|a, b| selection_order(a, b));
        Ok(available.into_iter().map(KeyEntry::from).collect())
    }

    async fn get_key(&self, name: &str) -> Result<Option<Key>> {
        let inner = self.inner.lock().await;
        Ok(inner.keys.get(name).cloned())
    }

    async fn list_keys(&self) -> Result<Vec<Key>> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<Key> = inner.keys.values().cloned().collect();
        keys.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(keys)
    }

    async fn record_usage(
        &self,
        name: &str,
        task: &str,
        token_delta: i64,
        request_type: &str,
        limits: &QuotaLimits,
    ) -> Result<UsageOutcome> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let key = inner
            .keys
            .get_mut(name)
            .ok_or_else(|| PoolError::KeyNotFound(name.to_string()))?;

        key.daily_request_count += 1;
        key.daily_token_total += token_delta;
        key.last_used = Some(now);

        let count = key.daily_request_count;
        let crossed_limit = count >= limits.daily_request_limit && !key.quota_exhausted;
        if crossed_limit {
            key.quota_exhausted = true;
        }
        let crossed_warning = !key.quota_warning_sent
            && count >= limits.warning_threshold
            && count < limits.daily_request_limit;
        if crossed_warning {
            key.quota_warning_sent = true;
        }

        let updated = key.clone();
        inner.usage_log.push(UsageLogEntry {
            key_name: name.to_string(),
            task: task.to_string(),
            token_count: token_delta,
            request_type: request_type.to_string(),
            created_at: now,
        });

        Ok(UsageOutcome {
            key: updated,
            crossed_warning,
            crossed_limit,
        })
    }

    async fn disable_key(&self, name: &str, cooldown: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = inner
            .keys
            .get_mut(name)
            .ok_or_else(|| PoolError::KeyNotFound(name.to_string()))?;
        key.disabled_until = Some(Utc::now() + cooldown_delta(cooldown));
        Ok(())
    }

    async fn release_key(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = inner
            .keys
            .get_mut(name)
            .ok_or_else(|| PoolError::KeyNotFound(name.to_string()))?;
        key.last_used = Some(Utc::now());
        Ok(())
    }
}
