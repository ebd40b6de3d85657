//! Fleet Crawler
//!
//! Controller for a fleet of automated browsing sessions: a bounded
//! dispatcher leases egress proxies from a managed pool, materializes
//! tunnel URIs as transient local SOCKS5 endpoints, and recycles every
//! resource between sessions so no network identity is shared.

pub mod dispatcher;
pub mod endpoint;
pub mod pool;
pub mod session;
pub mod stats;
pub mod tunnel;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use dispatcher::DispatcherConfig;
use pool::PoolConfig;
use tunnel::AdapterConfig;

/// Errors from startup configuration. These are the only errors that
/// terminate the controller.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

/// Controller configuration, built once from the environment and passed
/// explicitly to the pool and dispatcher.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Dispatcher worker cap
    pub threads: usize,
    /// Per-session target duration in seconds
    pub duration_secs: u64,
    /// Working-set target; defaults to twice the worker cap
    pub min_pool_size: usize,
    /// Failures beyond this count retire a proxy record
    pub max_failures: u32,
    pub no_proxy_backoff: Duration,
    pub failure_backoff_min: Duration,
    pub failure_backoff_max: Duration,
    /// Newline-delimited target URL list
    pub targets_path: PathBuf,
    /// Persisted raw proxy list
    pub proxies_path: PathBuf,
    /// Persisted tunnel URI list
    pub vless_path: PathBuf,
    /// Tunnel binary used by adapters
    pub xray_path: PathBuf,
    /// Schedule one batch of sessions, then exit
    pub run_once: bool,
    /// Direct connections only; the pool is never consulted
    pub no_proxy_mode: bool,
}

impl AppConfig {
    /// Load from environment variables, falling back to defaults for
    /// anything unset. A set-but-unparseable value is a fatal error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let threads: usize = env_parse("THREADS", 10)?;

        Ok(Self {
            threads,
            duration_secs: env_parse("DURATION", 30)?,
            min_pool_size: env_parse("MIN_POOL_SIZE", threads * 2)?,
            max_failures: env_parse("MAX_FAILURES", 3)?,
            no_proxy_backoff: Duration::from_millis(env_parse("NO_PROXY_BACKOFF_MS", 2_000)?),
            failure_backoff_min: Duration::from_millis(env_parse(
                "FAILURE_BACKOFF_MIN_MS",
                10_000,
            )?),
            failure_backoff_max: Duration::from_millis(env_parse(
                "FAILURE_BACKOFF_MAX_MS",
                20_000,
            )?),
            targets_path: env_path("TARGETS_PATH", "target_site.txt"),
            proxies_path: env_path("PROXIES_PATH", "proxies.txt"),
            vless_path: env_path("VLESS_PATH", "vless.txt"),
            xray_path: env_path("XRAY_PATH", "xray"),
            run_once: env_flag("RUN_ONCE"),
            no_proxy_mode: env_flag("NO_PROXY_MODE"),
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            threads: self.threads,
            session_duration: Duration::from_secs(self.duration_secs),
            no_proxy_backoff: self.no_proxy_backoff,
            failure_backoff_min: self.failure_backoff_min,
            failure_backoff_max: self.failure_backoff_max,
            run_once: self.run_once,
            no_proxy_mode: self.no_proxy_mode,
            ..Default::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_pool_size: self.min_pool_size,
            max_failures: self.max_failures,
            adapter: AdapterConfig {
                binary_path: self.xray_path.clone(),
                ..Default::default()
            },
            rng_seed: None,
        }
    }

    /// Read the target list. A missing or empty file leaves the
    /// dispatcher idling rather than failing startup.
    pub async fn load_targets(&self) -> Vec<String> {
        match tokio::fs::read_to_string(&self.targets_path).await {
            Ok(content) => {
                let targets: Vec<String> = content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                info!(
                    "Loaded {} targets from {}",
                    targets.len(),
                    self.targets_path.display()
                );
                targets
            }
            Err(e) => {
                warn!(
                    "Could not read targets from {}: {}",
                    self.targets_path.display(),
                    e
                );
                Vec::new()
            }
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Log directory under the platform config dir
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fleet-crawler").join("logs"))
}

/// Initialize logging: console always, plus a daily-rolling file when the
/// log directory is available. `RUST_LOG` overrides the default filter.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "fleet-crawler.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}
