// src/error.rs

use thiserror::Error;

/// Exit code used by the CLI when no key satisfies the availability
/// predicate. Exhaustion is an expected outcome, not an error, so it never
/// appears as a `PoolError` variant.
pub const EXIT_NO_AVAILABLE_KEY: u8 = 2;

/// Represents the possible errors that can occur in the pool manager.
///
/// Pool exhaustion is deliberately absent: an empty selection result is
/// reported as `Ok(None)` by the pool, never as an error.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    YamlParsing(#[from] serde_yaml::Error),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Key '{0}' not found")]
    KeyNotFound(String),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("Cache pool error: {0}")]
    CachePool(#[from] deadpool_redis::PoolError),

    #[cfg(feature = "redis")]
    #[error("Cache command error: {0}")]
    Cache(#[from] redis::RedisError),
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::CreatePoolError> for PoolError {
    fn from(e: deadpool_redis::CreatePoolError) -> Self {
        PoolError::Config(format!("Failed to create cache pool: {e}"))
    }
}

impl PoolError {
    /// Maps an error to the process exit code contract of the CLI:
    /// `3` for schema/configuration problems, `4` for storage connectivity,
    /// `1` for everything else. Success and "no available key" (`0`/`2`)
    /// are decided by the caller, not here.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::YamlParsing(_) | Self::Schema(_) => 3,
            Self::Storage(_) | Self::Migrate(_) | Self::Io(_) => 4,
            #[cfg(feature = "redis")]
            Self::CachePool(_) | Self::Cache(_) => 4,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_map_to_exit_3() {
        assert_eq!(PoolError::Config("bad".to_string()).exit_code(), 3);
        assert_eq!(PoolError::Schema("missing column".to_string()).exit_code(), 3);

        let yaml_err: serde_yaml::Error = serde_yaml::from_str::<()>("invalid: yaml:").unwrap_err();
        assert_eq!(PoolError::YamlParsing(yaml_err).exit_code(), 3);
    }

    #[test]
    fn storage_errors_map_to_exit_4() {
        assert_eq!(PoolError::Storage(sqlx::Error::PoolClosed).exit_code(), 4);

        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(PoolError::Io(io_err).exit_code(), 4);
    }

    #[test]
    fn other_errors_map_to_exit_1() {
        assert_eq!(PoolError::KeyNotFound("flash-03".to_string()).exit_code(), 1);
    }

    #[test]
    fn key_not_found_names_the_key() {
        let msg = PoolError::KeyNotFound("flash-03".to_string()).to_string();
        assert!(msg.contains("flash-03"));
    }
}
