//! Scheduler loop and worker protocol
//!
//! One scheduler task feeds a counting semaphore of `threads` slots. Each
//! worker runs exactly one session cycle: acquire, run, settle, back off,
//! return the slot. Shutdown wins every select; workers release their
//! leases gracefully on cancellation.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DispatcherConfig;
use crate::pool::ProxyPool;
use crate::session::SessionRunner;
use crate::stats::GlobalStats;

/// Bounded worker pool driving sessions against the target list.
pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    pool: Arc<ProxyPool>,
    runner: Arc<dyn SessionRunner>,
    targets: Arc<Vec<String>>,
    stats: Arc<GlobalStats>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        pool: Arc<ProxyPool>,
        runner: Arc<dyn SessionRunner>,
        targets: Vec<String>,
        stats: Arc<GlobalStats>,
    ) -> Self {
        Self {
            config: Arc::new(config.normalized()),
            pool,
            runner,
            targets: Arc::new(targets),
            stats,
        }
    }

    /// Run the scheduler loop until `shutdown` fires (or, in run-once
    /// mode, until one batch has been scheduled), then drain in-flight
    /// workers.
    pub async fn run(&self, shutdown: CancellationToken) {
        let config = self.config.clone();
        info!(
            "Dispatcher started: {} workers, {}s sessions{}",
            config.threads,
            config.session_duration.as_secs(),
            if config.run_once { " (run once)" } else { "" }
        );

        if self.targets.is_empty() {
            warn!("Target list is empty; workers will idle");
        }

        let semaphore = Arc::new(Semaphore::new(config.threads));
        let mut workers = JoinSet::new();
        let mut scheduled = 0usize;

        loop {
            if config.run_once && scheduled >= config.threads {
                info!("Run-once batch scheduled, waiting for completion");
                break;
            }

            // Shutdown beats a free slot
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            scheduled += 1;
            let worker = WorkerContext {
                config: config.clone(),
                pool: self.pool.clone(),
                runner: self.runner.clone(),
                targets: self.targets.clone(),
                stats: self.stats.clone(),
            };
            let cancel = shutdown.clone();
            workers.spawn(async move {
                let _permit = permit;
                worker.run_one(cancel).await;
            });

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.start_jitter) => {}
            }
        }

        self.drain(workers).await;
        info!("Dispatcher stopped");
    }

    /// Wait for in-flight workers; anything still running after the
    /// session window plus the grace period gets aborted.
    async fn drain(&self, mut workers: JoinSet<()>) {
        if workers.is_empty() {
            return;
        }
        info!("Waiting for {} in-flight workers", workers.len());

        let deadline = self.config.session_duration
            + self.config.session_slack
            + self.config.grace_period;
        let drained = tokio::time::timeout(deadline, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Workers exceeded the grace period, aborting {}", workers.len());
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    }
}

/// Everything one worker needs for a single session cycle
struct WorkerContext {
    config: Arc<DispatcherConfig>,
    pool: Arc<ProxyPool>,
    runner: Arc<dyn SessionRunner>,
    targets: Arc<Vec<String>>,
    stats: Arc<GlobalStats>,
}

enum Outcome {
    Completed,
    TimedOut,
    Failed(String),
    Cancelled,
}

impl WorkerContext {
    async fn run_one(&self, cancel: CancellationToken) {
        self.stats.worker_started();
        self.cycle(&cancel).await;
        self.stats.worker_finished();
    }

    async fn cycle(&self, cancel: &CancellationToken) {
        let lease = if self.config.no_proxy_mode {
            None
        } else {
            match self.pool.acquire().await {
                Some(lease) => Some(lease),
                None => {
                    self.stats.record_pool_exhausted();
                    debug!("No idle proxies, backing off");
                    cancellable_sleep(self.config.no_proxy_backoff, cancel).await;
                    return;
                }
            }
        };

        let targets = {
            let mut targets = self.targets.as_ref().clone();
            targets.shuffle(&mut rand::thread_rng());
            targets
        };

        let endpoint = lease.as_ref().map(|l| l.endpoint().clone());
        let watchdog = self.config.session_duration + self.config.session_slack;

        // A tunnel child that died between acquisition and here would make
        // every fetch fail anyway; penalize the lease without burning a
        // session on it.
        let outcome = if lease.as_ref().is_some_and(|l| !l.is_usable()) {
            Outcome::Failed("tunnel adapter died before the session started".into())
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                result = tokio::time::timeout(
                    watchdog,
                    self.runner.run(endpoint.as_ref(), &targets, self.config.session_duration),
                ) => match result {
                    Ok(Ok(())) => Outcome::Completed,
                    Ok(Err(e)) if e.is_timeout() => Outcome::TimedOut,
                    Ok(Err(e)) => Outcome::Failed(e.to_string()),
                    Err(_) => Outcome::TimedOut,
                },
            }
        };

        match outcome {
            Outcome::Cancelled => {
                // Graceful: shutdown is not the proxy's fault
                if let Some(lease) = lease {
                    self.pool.release(lease).await;
                }
            }
            Outcome::Completed => {
                if let Some(lease) = lease {
                    self.pool.release(lease).await;
                }
                self.stats.record_completed();
                let cooldown = jittered(self.config.cooldown_min, self.config.cooldown_max);
                cancellable_sleep(cooldown, cancel).await;
            }
            Outcome::TimedOut => {
                // Duration reached counts as a healthy session; restart fast
                if let Some(lease) = lease {
                    self.pool.release(lease).await;
                }
                self.stats.record_timed_out();
                cancellable_sleep(self.config.restart_delay, cancel).await;
            }
            Outcome::Failed(reason) => {
                warn!("Session failed: {}", reason);
                if let Some(lease) = lease {
                    self.pool.mark_failed(lease).await;
                }
                self.stats.record_failed();
                let penalty =
                    jittered(self.config.failure_backoff_min, self.config.failure_backoff_max);
                cancellable_sleep(penalty, cancel).await;
            }
        }
    }
}

/// Sleep that shutdown can interrupt
async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Uniform draw from a backoff window
fn jittered(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let range = (max - min).as_millis() as u64;
    min + Duration::from_millis(rand::thread_rng().gen_range(0..=range))
}
