// src/pool.rs

use crate::cache::KeyCache;
use crate::error::Result;
use crate::notify::{NotificationSink, NotifyLevel};
use crate::storage::{AcquireOptions, KeyEntry, KeyStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Selection and reservation front end over the durable store, with the
/// cache as a latency optimization.
///
/// Acquisition never blocks waiting for a key: an empty pool yields
/// `Ok(None)` immediately, and the sleep-and-retry policy (a cooldown on the
/// order of minutes between attempts, with the caller's own bounded backoff
/// for unrelated generation failures) belongs to the caller.
#[derive(Clone)]
pub struct KeyPool {
    store: Arc<dyn KeyStore>,
    cache: Arc<dyn KeyCache>,
    sink: Arc<dyn NotificationSink>,
}

impl KeyPool {
    pub fn new(
        store: Arc<dyn KeyStore>,
        cache: Arc<dyn KeyCache>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self { store, cache, sink }
    }

    pub fn store(&self) -> Arc<dyn KeyStore> {
        self.store.clone()
    }

    /// Hands out one available key, or `None` when the pool is exhausted.
    ///
    /// Requests without side effects try the cache first; a pop miss or a
    /// cache failure falls through to the claim query, and a successful
    /// claim refills the cache wholesale from a fresh availability scan.
    /// Side-effecting requests (`mark_use`, `reserve`) always take the
    /// claim transaction.
    #[instrument(level = "debug", skip(self, opts))]
    pub async fn acquire(&self, opts: &AcquireOptions) -> Result<Option<KeyEntry>> {
        if !opts.has_side_effects() {
            match self.cache.pop().await {
                Ok(Some(entry)) => {
                    debug!(key.name = %entry.name, key.preview = %entry.preview(), "Cache hit");
                    return Ok(Some(entry));
                }
                Ok(None) => debug!("Cache miss"),
                Err(e) => warn!(error = %e, "Cache unreachable; falling back to the store"),
            }
        }

        match self.store.select_key(opts).await? {
            Some(key) => {
                debug!(
                    key.name = %key.name,
                    key.preview = %key.preview(),
                    key.daily_request_count = key.daily_request_count,
                    "Selected key from store"
                );
                self.refill_cache().await;
                Ok(Some(KeyEntry::from(&key)))
            }
            None => {
                warn!("No available keys in the pool");
                self.sink
                    .notify("No available API keys in the pool.", NotifyLevel::Warning)
                    .await;
                Ok(None)
            }
        }
    }

    /// Returns a key to rotation by refreshing `last_used`, without touching
    /// its quota counters.
    pub async fn release(&self, name: &str) -> Result<()> {
        self.store.release_key(name).await
    }

    /// Puts a key on cooldown (`disabled_until = now + cooldown`) and forces
    /// a cache invalidation so stale copies of it cannot be served before
    /// the next refresh scan. This is how an upstream rate-limit signal
    /// removes a key from rotation.
    pub async fn disable(&self, name: &str, cooldown: Duration) -> Result<()> {
        self.store.disable_key(name, cooldown).await?;
        self.invalidate_cache().await;
        Ok(())
    }

    /// The single invalidation point used by every mutation path. Cache
    /// failure here is a performance regression, not an error: if the cache
    /// cannot be cleared it cannot serve pops either.
    pub async fn invalidate_cache(&self) {
        if let Err(e) = self.cache.invalidate().await {
            warn!(error = %e, "Cache invalidation failed");
        }
    }

    /// Wholesale cache refill from an availability scan; size is bounded by
    /// the scan itself. Best-effort on both the scan and the write.
    async fn refill_cache(&self) {
        match self.store.list_available().await {
            Ok(entries) => {
                let count = entries.len();
                if let Err(e) = self.cache.replace(entries).await {
                    warn!(error = %e, "Cache refill failed");
                } else {
                    debug!(cache.size = count, "Cache refilled from store scan");
                }
            }
            Err(e) => warn!(error = %e, "Availability scan for cache refill failed"),
        }
    }
}
