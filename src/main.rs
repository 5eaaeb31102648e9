// src/main.rs

use chrono::Utc;
use keypool::cli::{Cli, Commands, OutputFormat};
use keypool::config::{self, CacheConfig, PoolConfig};
use keypool::error::EXIT_NO_AVAILABLE_KEY;
use keypool::{
    AcquireOptions, InMemoryCache, KeyCache, KeyEntry, KeyPool, KeyStore, LogSink,
    NotificationSink, PgKeyStore, SlackWebhookSink, Throttle, UsageTracker,
};
use secrecy::ExposeSecret;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(&cli);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("keypool: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// All diagnostics go to stderr; stdout is reserved for selection output so
/// the binary stays usable in shell substitution.
fn init_tracing(cli: &Cli) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli) -> keypool::Result<ExitCode> {
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from("keypool.yaml"));
    let config = config::load_config(&config_path)?;

    if let Commands::Init = cli.command {
        PgKeyStore::run_migrations(&config.storage).await?;
        println!("Database schema is up to date.");
        return Ok(ExitCode::SUCCESS);
    }

    let store: Arc<dyn KeyStore> = Arc::new(PgKeyStore::connect(&config.storage).await?);
    let cache = build_cache(&config.cache);
    let sink = build_sink(&config);
    let pool = KeyPool::new(store.clone(), cache, sink.clone());

    match cli.command {
        Commands::Select {
            format,
            mark_use,
            reserve,
            allow_exhausted,
            throttle,
        } => {
            let opts = AcquireOptions {
                allow_exhausted,
                mark_use,
                reserve: reserve.filter(|s| *s > 0).map(Duration::from_secs),
            };
            match pool.acquire(&opts).await? {
                Some(entry) => {
                    if throttle {
                        let pacing = Throttle::new(
                            store.clone(),
                            Duration::from_secs(config.throttle.min_interval_secs),
                        );
                        pacing.wait_if_needed(&entry.name).await?;
                    }
                    print_selection(&entry, format);
                    Ok(ExitCode::SUCCESS)
                }
                None => Ok(ExitCode::from(EXIT_NO_AVAILABLE_KEY)),
            }
        }

        Commands::Track {
            key_name,
            tokens,
            task,
            request_type,
        } => {
            let tracker = UsageTracker::new(pool, sink, config.quota);
            let task = task.unwrap_or_else(default_task_id);
            let outcome = tracker.record(&key_name, &task, tokens, &request_type).await?;
            println!(
                "{}: {} requests today, quota exhausted: {}",
                key_name, outcome.key.daily_request_count, outcome.key.quota_exhausted
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Release { name } => {
            pool.release(&name).await?;
            println!("Released key '{name}'.");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Disable { name, cooldown_secs } => {
            let cooldown =
                Duration::from_secs(cooldown_secs.unwrap_or(config.cooldown.rate_limit_secs));
            pool.disable(&name, cooldown).await?;
            println!("Disabled key '{name}' for {}s.", cooldown.as_secs());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status => {
            print_status(store.as_ref()).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Init => unreachable!("handled before store construction"),
    }
}

fn build_cache(cfg: &CacheConfig) -> Arc<dyn KeyCache> {
    #[cfg(feature = "redis")]
    if let Some(url) = &cfg.redis_url {
        match keypool::RedisKeyCache::connect(url, &cfg.list_key) {
            Ok(cache) => return Arc::new(cache),
            Err(e) => warn!(error = %e, "Shared cache unavailable; continuing without it"),
        }
    }
    #[cfg(not(feature = "redis"))]
    if cfg.redis_url.is_some() {
        warn!("cache.redis_url is set but this binary was built without the 'redis' feature");
    }
    Arc::new(InMemoryCache::new())
}

fn build_sink(config: &PoolConfig) -> Arc<dyn NotificationSink> {
    match &config.notify.slack_webhook_url {
        Some(url) => Arc::new(SlackWebhookSink::new(url.clone())),
        None => Arc::new(LogSink),
    }
}

fn print_selection(entry: &KeyEntry, format: OutputFormat) {
    match format {
        OutputFormat::Plain => println!("{}", entry.secret.expose_secret()),
        OutputFormat::Env => {
            // Names kept predictable for wrapper scripts.
            println!("KEY_NAME={}", entry.name);
            println!("GEMINI_API_KEY={}", entry.secret.expose_secret());
        }
        OutputFormat::Json => {
            let payload = json!({
                "key_name": entry.name,
                "api_key": entry.secret.expose_secret(),
            });
            println!("{payload}");
        }
    }
}

async fn print_status(store: &dyn KeyStore) -> keypool::Result<()> {
    let keys = store.list_keys().await?;
    println!(
        "{:<24} {:<10} {:>9} {:>12} {:<20} {}",
        "KEY", "SECRET", "REQUESTS", "TOKENS", "LAST USED", "STATE"
    );
    let now = Utc::now();
    for key in keys {
        let last_used = key
            .last_used
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        let state = if key.quota_exhausted {
            "exhausted".to_string()
        } else {
            match key.disabled_until {
                Some(until) if until > now => {
                    format!("cooldown until {}", until.format("%H:%M:%S"))
                }
                _ => "available".to_string(),
            }
        };
        println!(
            "{:<24} {:<10} {:>9} {:>12} {:<20} {}",
            key.name,
            key.preview(),
            key.daily_request_count,
            key.daily_token_total,
            last_used,
            state
        );
    }
    Ok(())
}

fn default_task_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let date = Utc::now().format("%Y-%m-%d");
    let suffix = Uuid::new_v4().to_string();
    format!("{host}-{date}-{}", &suffix[..8])
}
