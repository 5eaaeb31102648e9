// src/storage/traits.rs

use crate::error::Result;
use crate::storage::key::{AcquireOptions, Key, KeyEntry, QuotaLimits, UsageOutcome};
use async_trait::async_trait;
use std::time::Duration;

/// Durable record of every key: usage counters, disablement state, quota
/// state. The single source of truth; the cache is never authoritative.
///
/// Every mutating operation runs inside one transaction together with the
/// read that justifies it, so concurrent callers on different keys proceed
/// in parallel and concurrent callers on the same key never observe a
/// read-then-write race.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Claim one available key, applying the requested side effects within
    /// the same claim. Returns `Ok(None)` when nothing matches, which is an
    /// expected outcome rather than an error. Concurrent callers skip rows
    /// claimed by each other instead of waiting for them.
    ///
    /// The returned counters reflect the row as read at claim time, before
    /// any `mark_use`/`reserve` side effect.
    async fn select_key(&self, opts: &AcquireOptions) -> Result<Option<Key>>;

    /// Snapshot of all currently-available keys in selection order; used for
    /// wholesale cache refills.
    async fn list_available(&self) -> Result<Vec<KeyEntry>>;

    /// Plain read of a single key, quota and cooldown state included.
    async fn get_key(&self, name: &str) -> Result<Option<Key>>;

    /// Every key in the pool regardless of availability.
    async fn list_keys(&self) -> Result<Vec<Key>>;

    /// Atomically bumps the counters, stamps `last_used`, appends the audit
    /// row, and latches the warning/exhaustion flags against `limits`.
    async fn record_usage(
        &self,
        name: &str,
        task: &str,
        token_delta: i64,
        request_type: &str,
        limits: &QuotaLimits,
    ) -> Result<UsageOutcome>;

    /// Takes a key out of rotation until `now + cooldown`. Quota counters
    /// are untouched; the window simply expires.
    async fn disable_key(&self, name: &str, cooldown: Duration) -> Result<()>;

    /// Returns a key to rotation by refreshing `last_used`, used after a
    /// transient failure that should not count against its quota.
    async fn release_key(&self, name: &str) -> Result<()>;
}
