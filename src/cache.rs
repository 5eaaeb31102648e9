// src/cache.rs

use crate::error::Result;
use crate::storage::KeyEntry;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Best-effort accelerator holding a snapshot of currently-available keys.
///
/// Entries carry no freshness guarantee beyond "was true at last refresh".
/// Correctness comes from the store being authoritative for every mutation
/// and from forced invalidation on disable/exhaustion, not from a TTL.
/// Losing the cache entirely degrades latency, never correctness.
#[async_trait]
pub trait KeyCache: Send + Sync {
    /// Pops the next entry from the front of the queue.
    async fn pop(&self) -> Result<Option<KeyEntry>>;

    /// Replaces the whole queue with a fresh snapshot. Always wholesale,
    /// never a merge, so keys that became unavailable between scans cannot
    /// be served indefinitely.
    async fn replace(&self, entries: Vec<KeyEntry>) -> Result<()>;

    /// Drops every entry. The single invalidation primitive behind
    /// `KeyPool::invalidate_cache`.
    async fn invalidate(&self) -> Result<()>;

    async fn len(&self) -> Result<usize>;
}

/// Process-local queue used in tests and when no shared cache is configured.
pub struct InMemoryCache {
    entries: Arc<Mutex<VecDeque<KeyEntry>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyCache for InMemoryCache {
    async fn pop(&self) -> Result<Option<KeyEntry>> {
        Ok(self.entries.lock().await.pop_front())
    }

    async fn replace(&self, entries: Vec<KeyEntry>) -> Result<()> {
        let mut guard = self.entries.lock().await;
        *guard = entries.into();
        Ok(())
    }

    async fn invalidate(&self) -> Result<()> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().await.len())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_cache::RedisKeyCache;

#[cfg(feature = "redis")]
mod redis_cache {
    use super::*;
    use crate::error::PoolError;
    use deadpool_redis::{Config as RedisConfig, Connection, Pool, Runtime};
    use redis::AsyncCommands;
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Serialize};
    use tracing::warn;

    /// Wire format for entries in the shared Redis list. Secrets travel in
    /// the clear here, mirroring what the durable store holds.
    #[derive(Serialize, Deserialize)]
    struct WireEntry {
        key_name: String,
        secret: String,
    }

    /// Redis-backed queue shared by every process using the pool. Any
    /// process may clear or repopulate it.
    pub struct RedisKeyCache {
        pool: Pool,
        list_key: String,
    }

    impl RedisKeyCache {
        pub fn connect(redis_url: &str, list_key: impl Into<String>) -> Result<Self> {
            let pool = RedisConfig::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;
            Ok(Self {
                pool,
                list_key: list_key.into(),
            })
        }

        async fn get_connection(&self) -> Result<Connection> {
            self.pool.get().await.map_err(PoolError::from)
        }
    }

    #[async_trait]
    impl KeyCache for RedisKeyCache {
        async fn pop(&self) -> Result<Option<KeyEntry>> {
            let mut conn = self.get_connection().await?;
            let payload: Option<String> = conn.lpop(&self.list_key, None).await?;
            let Some(payload) = payload else {
                return Ok(None);
            };
            match serde_json::from_str::<WireEntry>(&payload) {
                Ok(wire) => Ok(Some(KeyEntry {
                    name: wire.key_name,
                    secret: SecretString::new(wire.secret),
                })),
                Err(e) => {
                    // A corrupt entry is dropped; the store remains the
                    // source of truth on the resulting miss.
                    warn!(error = %e, "Discarding unparseable cache entry");
                    Ok(None)
                }
            }
        }

        async fn replace(&self, entries: Vec<KeyEntry>) -> Result<()> {
            let mut conn = self.get_connection().await?;
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.del(&self.list_key);
            for entry in &entries {
                let payload = serde_json::to_string(&WireEntry {
                    key_name: entry.name.clone(),
                    secret: entry.secret.expose_secret().clone(),
                })?;
                pipe.rpush(&self.list_key, payload);
            }
            let _: () = pipe.query_async(&mut conn).await?;
            debug!(cache.size = entries.len(), "Refreshed key cache");
            Ok(())
        }

        async fn invalidate(&self) -> Result<()> {
            let mut conn = self.get_connection().await?;
            let _: () = conn.del(&self.list_key).await?;
            debug!("Key cache invalidated");
            Ok(())
        }

        async fn len(&self) -> Result<usize> {
            let mut conn = self.get_connection().await?;
            let len: usize = conn.llen(&self.list_key).await?;
            Ok(len)
        }
    }
}
