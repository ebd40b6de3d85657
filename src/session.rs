//! Session runner seam
//!
//! The dispatcher only knows how to hand a leased endpoint, a target list,
//! and a duration to something that runs one browsing session. The heavy
//! browser automation stack lives behind this trait; a lightweight HTTP
//! runner is included for fleets that only need plain page fetches.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;

/// How a session ended, as seen by the pool bookkeeping
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The session ran out its target duration. Counts as success for
    /// proxy health: the egress identity did its job for the full window.
    #[error("session reached its target duration")]
    Timeout,

    #[error("session failed: {0}")]
    Failed(String),
}

impl RunnerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunnerError::Timeout)
    }
}

/// Executes one browser session against the given targets.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    /// Run one session through `proxy` (or the direct connection when
    /// `None`) for roughly `duration`.
    async fn run(
        &self,
        proxy: Option<&Endpoint>,
        targets: &[String],
        duration: Duration,
    ) -> Result<(), RunnerError>;
}

/// Minimal concrete runner: cycles through the targets with plain HTTP
/// fetches and per-page dwell times until the session duration is spent.
pub struct HttpSessionRunner {
    request_timeout: Duration,
}

impl HttpSessionRunner {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    fn build_client(&self, proxy: Option<&Endpoint>) -> Result<reqwest::Client, RunnerError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .user_agent(
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
            );

        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint.proxy_url())
                .map_err(|e| RunnerError::Failed(format!("invalid proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| RunnerError::Failed(format!("client build: {e}")))
    }
}

impl Default for HttpSessionRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl SessionRunner for HttpSessionRunner {
    async fn run(
        &self,
        proxy: Option<&Endpoint>,
        targets: &[String],
        duration: Duration,
    ) -> Result<(), RunnerError> {
        if targets.is_empty() {
            return Err(RunnerError::Failed("no targets".into()));
        }

        let client = self.build_client(proxy)?;
        let started = Instant::now();
        let mut fetched = 0u32;

        for target in targets.iter().cycle() {
            if started.elapsed() >= duration {
                break;
            }

            match client.get(target).send().await {
                Ok(response) => {
                    debug!("Fetched {} ({})", target, response.status());
                    // Drain the body so the transfer actually happens
                    let _ = response.bytes().await;
                    fetched += 1;
                }
                Err(e) => {
                    // The first request is the proxy health probe; a dead
                    // egress fails the session rather than burning the
                    // whole duration on errors.
                    if fetched == 0 {
                        return Err(RunnerError::Failed(format!("{target}: {e}")));
                    }
                    warn!("Fetch failed mid-session for {}: {}", target, e);
                }
            }

            let dwell = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(1_000..4_000))
            };
            let remaining = duration.saturating_sub(started.elapsed());
            tokio::time::sleep(dwell.min(remaining)).await;
        }

        debug!(
            "Session finished: {} fetches over {:?}",
            fetched,
            started.elapsed()
        );
        Ok(())
    }
}
