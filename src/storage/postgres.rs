// src/storage/postgres.rs

use crate::config::StorageConfig;
use crate::error::{PoolError, Result};
use crate::storage::key::{AcquireOptions, Key, KeyEntry, QuotaLimits, UsageOutcome};
use crate::storage::traits::KeyStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Column names historically used for the credential value, probed in order.
const SECRET_COLUMNS: &[&str] = &["secret", "api_key", "key_value"];

const KEY_COLUMNS: &str = "key_name, daily_request_count, daily_token_total, \
     last_used, disabled_until, quota_exhausted, quota_warning_sent";

/// PostgreSQL implementation of the key store.
///
/// The claim query relies on `FOR UPDATE SKIP LOCKED`, so N concurrent
/// callers against M available rows each lock a distinct row without
/// queueing behind one another; callers left without a row get an empty
/// result instead of blocking. Row locks live only for the duration of the
/// claim transaction, so a crashed caller can never leak a locked key.
pub struct PgKeyStore {
    pool: PgPool,
    secret_column: &'static str,
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    key_name: String,
    secret: String,
    daily_request_count: i64,
    daily_token_total: i64,
    last_used: Option<DateTime<Utc>>,
    disabled_until: Option<DateTime<Utc>>,
    quota_exhausted: Option<bool>,
    quota_warning_sent: Option<bool>,
}

impl From<KeyRow> for Key {
    fn from(row: KeyRow) -> Self {
        Key {
            name: row.key_name,
            secret: SecretString::new(row.secret),
            daily_request_count: row.daily_request_count,
            daily_token_total: row.daily_token_total,
            last_used: row.last_used,
            disabled_until: row.disabled_until,
            quota_exhausted: row.quota_exhausted.unwrap_or(false),
            quota_warning_sent: row.quota_warning_sent.unwrap_or(false),
        }
    }
}

impl PgKeyStore {
    /// Connects and verifies the schema. A missing `api_keys` table or
    /// secret column is a schema error, reported distinctly from
    /// connectivity failures and never retried.
    #[instrument(skip(config), name = "pg_key_store_connect")]
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let pool = Self::build_pool(config).await?;
        let secret_column = Self::verify_schema(&pool).await?;
        info!(
            storage.secret_column = secret_column,
            "Connected to key store"
        );
        Ok(Self {
            pool,
            secret_column,
        })
    }

    /// Applies the embedded migrations. Used by `keypool init`, which must
    /// run before `connect` can verify anything on a fresh database.
    pub async fn run_migrations(config: &StorageConfig) -> Result<()> {
        let pool = Self::build_pool(config).await?;
        sqlx::migrate!().run(&pool).await?;
        info!("Database schema is up to date");
        Ok(())
    }

    async fn build_pool(config: &StorageConfig) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await?;
        Ok(pool)
    }

    /// Checks that `api_keys` exists and determines which column holds the
    /// credential value, so the store works against legacy layouts that
    /// predate the `secret` column name.
    async fn verify_schema(pool: &PgPool) -> Result<&'static str> {
        let table_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'api_keys')",
        )
        .fetch_one(pool)
        .await?;

        if !table_exists {
            return Err(PoolError::Schema(
                "table 'api_keys' does not exist; run `keypool init` first".to_string(),
            ));
        }

        for &column in SECRET_COLUMNS {
            let present: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
                 WHERE table_name = 'api_keys' AND column_name = $1)",
            )
            .bind(column)
            .fetch_one(pool)
            .await?;
            if present {
                debug!(storage.secret_column = column, "Detected secret column");
                return Ok(column);
            }
        }

        Err(PoolError::Schema(format!(
            "no secret column found in 'api_keys' (tried {})",
            SECRET_COLUMNS.join(", ")
        )))
    }
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn select_key(&self, opts: &AcquireOptions) -> Result<Option<Key>> {
        let exhausted_clause = if opts.allow_exhausted {
            ""
        } else {
            "AND (quota_exhausted = FALSE OR quota_exhausted IS NULL)"
        };
        let sql = format!(
            "SELECT {KEY_COLUMNS}, {secret} AS secret FROM api_keys \
             WHERE (disabled_until IS NULL OR disabled_until < NOW()) {exhausted_clause} \
             ORDER BY daily_request_count ASC, daily_token_total ASC, last_used ASC NULLS FIRST \
             FOR UPDATE SKIP LOCKED \
             LIMIT 1",
            secret = self.secret_column,
        );

        let mut tx = self.pool.begin().await?;

        let row: Option<KeyRow> = sqlx::query_as(&sql).fetch_optional(&mut *tx).await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        if opts.mark_use {
            sqlx::query(
                "UPDATE api_keys SET daily_request_count = daily_request_count + 1, \
                 last_used = NOW() WHERE key_name = $1",
            )
            .bind(&row.key_name)
            .execute(&mut *tx)
            .await?;
        }
        if let Some(window) = opts.reserve {
            sqlx::query(
                "UPDATE api_keys SET disabled_until = NOW() + make_interval(secs => $1) \
                 WHERE key_name = $2",
            )
            .bind(window.as_secs_f64())
            .bind(&row.key_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(row.into()))
    }

    async fn list_available(&self) -> Result<Vec<KeyEntry>> {
        let sql = format!(
            "SELECT {KEY_COLUMNS}, {secret} AS secret FROM api_keys \
             WHERE (quota_exhausted = FALSE OR quota_exhausted IS NULL) \
               AND (disabled_until IS NULL OR disabled_until < NOW()) \
             ORDER BY daily_request_count ASC, daily_token_total ASC, last_used ASC NULLS FIRST",
            secret = self.secret_column,
        );
        let rows: Vec<KeyRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| KeyEntry::from(&Key::from(row)))
            .collect())
    }

    async fn get_key(&self, name: &str) -> Result<Option<Key>> {
        let sql = format!(
            "SELECT {KEY_COLUMNS}, {secret} AS secret FROM api_keys WHERE key_name = $1",
            secret = self.secret_column,
        );
        let row: Option<KeyRow> = sqlx::query_as(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Key::from))
    }

    async fn list_keys(&self) -> Result<Vec<Key>> {
        let sql = format!(
            "SELECT {KEY_COLUMNS}, {secret} AS secret FROM api_keys ORDER BY key_name",
            secret = self.secret_column,
        );
        let rows: Vec<KeyRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Key::from).collect())
    }

    async fn record_usage(
        &self,
        name: &str,
        task: &str,
        token_delta: i64,
        request_type: &str,
        limits: &QuotaLimits,
    ) -> Result<UsageOutcome> {
        let sql = format!(
            "UPDATE api_keys SET daily_request_count = daily_request_count + 1, \
             daily_token_total = daily_token_total + $1, last_used = NOW() \
             WHERE key_name = $2 \
             RETURNING {KEY_COLUMNS}, {secret} AS secret",
            secret = self.secret_column,
        );

        let mut tx = self.pool.begin().await?;

        let row: Option<KeyRow> = sqlx::query_as(&sql)
            .bind(token_delta)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(PoolError::KeyNotFound(name.to_string()));
        };
        let mut key = Key::from(row);

        let count = key.daily_request_count;
        let crossed_limit = count >= limits.daily_request_limit && !key.quota_exhausted;
        if crossed_limit {
            sqlx::query("UPDATE api_keys SET quota_exhausted = TRUE WHERE key_name = $1")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            key.quota_exhausted = true;
        }
        let crossed_warning = !key.quota_warning_sent
            && count >= limits.warning_threshold
            && count < limits.daily_request_limit;
        if crossed_warning {
            sqlx::query("UPDATE api_keys SET quota_warning_sent = TRUE WHERE key_name = $1")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            key.quota_warning_sent = true;
        }

        sqlx::query(
            "INSERT INTO usage_log (key_name, task, token_count, request_type) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(name)
        .bind(task)
        .bind(token_delta)
        .bind(request_type)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(UsageOutcome {
            key,
            crossed_warning,
            crossed_limit,
        })
    }

    async fn disable_key(&self, name: &str, cooldown: Duration) -> Result<()> {
        let result = sqlx::query(
            "UPDATE api_keys SET disabled_until = NOW() + make_interval(secs => $1) \
             WHERE key_name = $2",
        )
        .bind(cooldown.as_secs_f64())
        .bind(name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PoolError::KeyNotFound(name.to_string()));
        }
        warn!(
            key.name = name,
            cooldown_secs = cooldown.as_secs(),
            "Key placed on cooldown"
        );
        Ok(())
    }

    async fn release_key(&self, name: &str) -> Result<()> {
        let result = sqlx::query("UPDATE api_keys SET last_used = NOW() WHERE key_name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(PoolError::KeyNotFound(name.to_string()));
        }
        debug!(key.name = name, "Key released back to rotation");
        Ok(())
    }
}
