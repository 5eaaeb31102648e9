// src/storage/key.rs

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::cmp::Ordering;
use std::time::Duration;

/// One pooled credential, as stored in the `api_keys` table.
///
/// Counters are monotonic within a day and reset by an external daily job;
/// nothing in this crate ever decrements them. `quota_exhausted` and
/// `quota_warning_sent` are sticky flags cleared by the same job.
#[derive(Debug, Clone)]
pub struct Key {
    pub name: String,
    pub secret: SecretString,
    pub daily_request_count: i64,
    pub daily_token_total: i64,
    pub last_used: Option<DateTime<Utc>>,
    pub disabled_until: Option<DateTime<Utc>>,
    pub quota_exhausted: bool,
    pub quota_warning_sent: bool,
}

impl Key {
    /// Availability predicate: not quota-exhausted (unless the caller opts
    /// in) and not inside a cooldown window.
    pub fn is_available(&self, allow_exhausted: bool) -> bool {
        self.is_available_at(Utc::now(), allow_exhausted)
    }

    pub fn is_available_at(&self, now: DateTime<Utc>, allow_exhausted: bool) -> bool {
        if self.quota_exhausted && !allow_exhausted {
            return false;
        }
        match self.disabled_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    /// Masked form safe for logs: only a fixed-length suffix of the secret.
    pub fn preview(&self) -> String {
        secret_preview(&self.secret)
    }
}

/// Compares two keys in selection order: lowest daily request count first,
/// then lowest token total, then oldest `last_used` with never-used keys
/// sorting before everything else.
pub fn selection_order(a: &Key, b: &Key) -> Ordering {
    a.daily_request_count
        .cmp(&b.daily_request_count)
        .then(a.daily_token_total.cmp(&b.daily_token_total))
        .then(a.last_used.cmp(&b.last_used))
}

pub(crate) fn secret_preview(secret: &SecretString) -> String {
    let exposed = secret.expose_secret();
    if exposed.len() >= 4 {
        format!("...{}", &exposed[exposed.len() - 4..])
    } else {
        "...".to_string()
    }
}

/// The `{name, secret}` pair handed out by the pool and duplicated into the
/// cache. Carries no freshness guarantee; the store stays authoritative for
/// every mutation.
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub name: String,
    pub secret: SecretString,
}

impl KeyEntry {
    pub fn preview(&self) -> String {
        secret_preview(&self.secret)
    }
}

impl From<&Key> for KeyEntry {
    fn from(key: &Key) -> Self {
        Self {
            name: key.name.clone(),
            secret: key.secret.clone(),
        }
    }
}

/// Optional side effects applied atomically inside the claim transaction.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Include quota-exhausted keys in the candidate set.
    pub allow_exhausted: bool,
    /// Increment `daily_request_count` and set `last_used` at claim time.
    pub mark_use: bool,
    /// Soft-reserve the key by setting `disabled_until` this far into the
    /// future, so concurrent callers skip it until the holder has used it.
    pub reserve: Option<Duration>,
}

impl AcquireOptions {
    /// Side effects require the claim transaction, so they always bypass
    /// the cache fast path.
    pub fn has_side_effects(&self) -> bool {
        self.mark_use || self.reserve.is_some()
    }

    pub fn allow_exhausted(mut self) -> Self {
        self.allow_exhausted = true;
        self
    }

    pub fn mark_use(mut self) -> Self {
        self.mark_use = true;
        self
    }

    pub fn reserve(mut self, window: Duration) -> Self {
        self.reserve = Some(window);
        self
    }
}

/// Daily quota limits, shared between configuration and usage tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaLimits {
    #[serde(default = "default_daily_request_limit")]
    pub daily_request_limit: i64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: i64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            daily_request_limit: default_daily_request_limit(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

fn default_daily_request_limit() -> i64 {
    60
}

fn default_warning_threshold() -> i64 {
    55
}

/// Result of a `record_usage` transaction: the updated key plus which quota
/// boundaries this particular call crossed. Each crossing fires at most once
/// per day because it is latched by the sticky flags on the row itself.
#[derive(Debug, Clone)]
pub struct UsageOutcome {
    pub key: Key,
    pub crossed_warning: bool,
    pub crossed_limit: bool,
}

/// One append-only audit row in `usage_log`.
#[derive(Debug, Clone)]
pub struct UsageLogEntry {
    pub key_name: String,
    pub task: String,
    pub token_count: i64,
    pub request_type: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn key(name: &str) -> Key {
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

    #[test]
    fn fresh_key_is_available() {
        assert!(key("a").is_available(false));
    }

    #[test]
    fn exhausted_key_needs_opt_in() {
        let mut k = key("a");
        k.quota_exhausted = true;
        assert!(!k.is_available(false));
        assert!(k.is_available(true));
    }

    #[test]
    fn cooldown_expires_with_the_clock() {
        let mut k = key("a");
        let now = Utc::now();
        k.disabled_until = Some(now + TimeDelta::seconds(30));
        assert!(!k.is_available_at(now, false));
        assert!(k.is_available_at(now + TimeDelta::seconds(31), false));
    }

    #[test]
    fn selection_prefers_low_counts_then_oldest_use() {
        let now = Utc::now();
        let mut a = key("a");
        a.daily_request_count = 10;
        let mut b = key("b");
        b.daily_request_count = 2;
        b.last_used = Some(now);
        let mut c = key("c");
        c.daily_request_count = 2;
        c.last_used = Some(now - TimeDelta::hours(1));

        assert_eq!(selection_order(&c, &b), Ordering::Less);
        assert_eq!(selection_order(&b, &a), Ordering::Less);
    }

    #[test]
    fn never_used_sorts_before_recently_used() {
        let mut a = key("a");
        a.last_used = Some(Utc::now());
        let b = key("b");
        assert_eq!(selection_order(&b, &a), Ordering::Less);
    }

    #[test]
    fn preview_hides_all_but_the_suffix() {
        let k = key("prod");
        let preview = k.preview();
        assert!(preview.starts_with("..."));
        assert_eq!(preview.len(), 7);
        assert!(!preview.contains("sk-prod"));
    }
}
