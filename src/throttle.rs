// src/throttle.rs

use crate::error::{PoolError, Result};
use crate::storage::KeyStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Cooperative per-key pacing guard.
///
/// Suspends the current caller until the key's minimum inter-request
/// interval has elapsed since `last_used`. This only protects the caller's
/// own next call; two processes racing on the same key can still produce
/// back-to-back requests, which is accepted as best-effort pacing rather
/// than a hard guarantee.
pub struct Throttle {
    store: Arc<dyn KeyStore>,
    min_interval: Duration,
}

impl Throttle {
    pub fn new(store: Arc<dyn KeyStore>, min_interval: Duration) -> Self {
        Self {
            store,
            min_interval,
        }
    }

    /// Sleeps off the remainder of the interval, returning how long it
    /// waited (`None` when no wait was needed).
    pub async fn wait_if_needed(&self, name: &str) -> Result<Option<Duration>> {
        let key = self
            .store
            .get_key(name)
            .await?
            .ok_or_else(|| PoolError::KeyNotFound(name.to_string()))?;

        let Some(last_used) = key.last_used else {
            return Ok(None);
        };

        // A last_used in the future (clock skew) errors out of to_std and
        // is treated as zero elapsed, i.e. a full wait.
        let elapsed = (Utc::now() - last_used).to_std().unwrap_or_default();
        if elapsed >= self.min_interval {
            return Ok(None);
        }

        let wait = self.min_interval - elapsed;
        info!(
            key.name = name,
            wait_ms = wait.as_millis() as u64,
            "Throttling before next use"
        );
        tokio::time::sleep(wait).await;
        Ok(Some(wait))
    }
}
