//! Controller binary
//!
//! Wires the configuration, pool, and dispatcher together, runs until a
//! shutdown signal arrives, then persists the surviving pool records.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fleet_crawler::dispatcher::Dispatcher;
use fleet_crawler::pool::ProxyPool;
use fleet_crawler::session::{HttpSessionRunner, SessionRunner};
use fleet_crawler::stats::GlobalStats;
use fleet_crawler::AppConfig;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let _log_guard = fleet_crawler::init_logging();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    info!(
        "Starting fleet-crawler (threads: {}, duration: {}s, run_once: {}, no_proxy: {})",
        config.threads, config.duration_secs, config.run_once, config.no_proxy_mode
    );

    let targets = config.load_targets().await;

    let pool = Arc::new(ProxyPool::new(config.pool_config()));
    if config.no_proxy_mode {
        info!("NO_PROXY_MODE set, skipping proxy pool initialization");
    } else {
        if let Err(e) = pool.load_from_file(&config.proxies_path).await {
            warn!("Failed to load {}: {}", config.proxies_path.display(), e);
        }
        if let Err(e) = pool.load_from_file(&config.vless_path).await {
            warn!("Failed to load {}: {}", config.vless_path.display(), e);
        }
        info!(
            "Proxy pool primed: {} working, {} in reserve",
            pool.size(),
            pool.reserve_size()
        );
    }

    let stats = Arc::new(GlobalStats::new());
    let runner: Arc<dyn SessionRunner> = Arc::new(HttpSessionRunner::default());
    let dispatcher = Dispatcher::new(
        config.dispatcher_config(),
        pool.clone(),
        runner,
        targets,
        stats.clone(),
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    dispatcher.run(shutdown).await;

    if !config.no_proxy_mode {
        if let Err(e) = pool.save_to_file(&config.proxies_path).await {
            warn!("Failed to save {}: {}", config.proxies_path.display(), e);
        }
        if let Err(e) = pool.save_tunnels_to_file(&config.vless_path).await {
            warn!("Failed to save {}: {}", config.vless_path.display(), e);
        }
    }

    let snapshot = stats.snapshot();
    info!(
        "Shutdown complete: {} completed, {} failed, {} timed out ({:.1}/h)",
        snapshot.tasks_completed,
        snapshot.tasks_failed,
        snapshot.tasks_timed_out,
        snapshot.completion_rate
    );
}

/// Cancel the token on SIGINT or, on unix, SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Shutdown signal received");
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Shutdown signal received");
        shutdown.cancel();
    });
}
