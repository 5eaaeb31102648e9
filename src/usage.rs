// src/usage.rs

use crate::error::Result;
use crate::notify::{NotificationSink, NotifyLevel};
use crate::pool::KeyPool;
use crate::storage::{QuotaLimits, UsageOutcome};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Records consumption against a key after use and reacts to quota
/// boundaries: a near-quota warning at the threshold, exhaustion at the
/// limit.
///
/// Crossing detection is latched by the sticky flags on the key row, so a
/// counter sitting above the threshold keeps firing nothing, and a counter
/// that skips over the exact threshold value still fires once.
pub struct UsageTracker {
    pool: KeyPool,
    sink: Arc<dyn NotificationSink>,
    limits: QuotaLimits,
}

impl UsageTracker {
    pub fn new(pool: KeyPool, sink: Arc<dyn NotificationSink>, limits: QuotaLimits) -> Self {
        Self { pool, sink, limits }
    }

    /// Applies one request's worth of consumption: count + 1, tokens +
    /// `token_delta`, `last_used = now`, plus the append-only audit row.
    /// Quota flags flip inside the same store transaction; the cache is
    /// invalidated and notifications go out afterwards, fire-and-forget.
    #[instrument(level = "debug", skip(self), fields(key.name = name))]
    pub async fn record(
        &self,
        name: &str,
        task: &str,
        token_delta: i64,
        request_type: &str,
    ) -> Result<UsageOutcome> {
        let outcome = self
            .pool
            .store()
            .record_usage(name, task, token_delta, request_type, &self.limits)
            .await?;

        info!(
            key.name = name,
            key.daily_request_count = outcome.key.daily_request_count,
            key.daily_token_total = outcome.key.daily_token_total,
            "Recorded usage"
        );

        if outcome.crossed_warning {
            let message = format!(
                "API key '{}' is nearing its daily quota, having made {} requests.",
                name, outcome.key.daily_request_count
            );
            warn!(key.name = name, "{message}");
            self.sink.notify(&message, NotifyLevel::Warning).await;
        }

        if outcome.crossed_limit {
            let message = format!(
                "API key '{}' has reached its daily quota with {} requests.",
                name, outcome.key.daily_request_count
            );
            warn!(key.name = name, "{message}");
            self.pool.invalidate_cache().await;
            self.sink.notify(&message, NotifyLevel::Error).await;
        }

        Ok(outcome)
    }
}
