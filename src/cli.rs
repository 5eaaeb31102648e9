// src/cli.rs

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "keypool",
    version,
    about = "Shared API key pool manager with quota tracking and concurrency-safe selection",
    long_about = "Selects, reserves, throttles, and retires credentials out of a shared pool of \
rate-limited API keys, safely under concurrent access from multiple independent processes."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "KEYPOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "KEYPOOL_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Select one available key from the pool
    Select {
        /// Output format. 'plain' prints only the API key
        #[arg(long, value_enum, default_value = "plain")]
        format: OutputFormat,

        /// Increment the request counter and set last_used at selection time
        #[arg(long)]
        mark_use: bool,

        /// Soft-reserve the key for this many seconds so concurrent callers skip it
        #[arg(long, value_name = "SECONDS")]
        reserve: Option<u64>,

        /// Ignore quota_exhausted and still select unlocked keys
        #[arg(long)]
        allow_exhausted: bool,

        /// Wait out the key's minimum inter-request interval before printing
        #[arg(long)]
        throttle: bool,
    },

    /// Record usage for a key after a request
    Track {
        /// Name of the key that was used
        #[arg(long)]
        key_name: String,

        /// Token count consumed by the request
        #[arg(long, default_value_t = 0)]
        tokens: i64,

        /// Task identifier for the audit trail (generated if omitted)
        #[arg(long)]
        task: Option<String>,

        /// Request type label for the audit trail
        #[arg(long, default_value = "cli")]
        request_type: String,
    },

    /// Return a key to rotation by refreshing its last_used timestamp
    Release {
        /// Name of the key to release
        name: String,
    },

    /// Put a key on cooldown without touching its quota counters
    Disable {
        /// Name of the key to disable
        name: String,

        /// Cooldown window in seconds (defaults to the configured rate-limit cooldown)
        #[arg(long, value_name = "SECONDS")]
        cooldown_secs: Option<u64>,
    },

    /// Show every key with its usage counters and availability
    Status,

    /// Create or update the database schema
    Init,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Plain,
    Env,
    Json,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
