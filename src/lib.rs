// src/lib.rs

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod notify;
pub mod pool;
pub mod storage;
pub mod throttle;
pub mod usage;

pub use cache::{InMemoryCache, KeyCache};
pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use notify::{LogSink, NotificationSink, NotifyLevel, SlackWebhookSink};
pub use pool::KeyPool;
pub use storage::{
    AcquireOptions, InMemoryStore, Key, KeyEntry, KeyStore, PgKeyStore, QuotaLimits,
};
pub use throttle::Throttle;
pub use usage::UsageTracker;

#[cfg(feature = "redis")]
pub use cache::RedisKeyCache;
