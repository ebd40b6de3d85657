//! Tunnel child process supervision
//!
//! One adapter owns one tunnel process for the lifetime of a pool lease.
//! Start reserves a loopback port, spawns the binary against a generated
//! config, and refuses to return until the SOCKS5 inbound is accepting
//! connections. Close tears the child down from any task, exactly once.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{build_tunnel_config, TunnelSpec};
use crate::endpoint::Endpoint;

/// Interval between readiness probes against the child's SOCKS5 port
const READY_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Errors surfaced by adapter startup and use
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("tunnel binary not found: {0}")]
    BinaryNotFound(String),

    #[error("failed to spawn tunnel process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("tunnel process exited during startup ({0})")]
    EarlyExit(String),

    #[error("tunnel did not accept connections on port {port} within {timeout_ms}ms")]
    StartTimeout { port: u16, timeout_ms: u64 },

    #[error("adapter is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Adapter tuning knobs, part of the controller configuration
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Path or name of the tunnel binary
    pub binary_path: PathBuf,
    /// How long to wait for the SOCKS5 inbound to come up
    pub start_timeout: Duration,
    /// Grace between SIGTERM and SIGKILL on close
    pub grace_period: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("xray"),
            start_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(2),
        }
    }
}

/// A supervised local SOCKS5 listener backed by one tunnel process.
#[derive(Debug)]
pub struct TunnelAdapter {
    local_port: u16,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelAdapter {
    /// Materialize a spec as a local SOCKS5 endpoint.
    ///
    /// Returns only once the child accepts connections, or with an error
    /// after which the child no longer runs.
    pub async fn start(spec: &TunnelSpec, config: &AdapterConfig) -> Result<Self, AdapterError> {
        let local_port = allocate_free_port()?;
        let config_path = write_config_file(spec, local_port).await?;

        debug!(
            "Starting tunnel adapter for {} on 127.0.0.1:{}",
            spec.canonical(),
            local_port
        );

        let mut child = match Command::new(&config.binary_path)
            .arg("-c")
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_file(&config_path).await;
                return Err(if e.kind() == std::io::ErrorKind::NotFound {
                    AdapterError::BinaryNotFound(config.binary_path.display().to_string())
                } else {
                    AdapterError::Spawn(e)
                });
            }
        };

        if let Err(e) = wait_until_accepting(&mut child, local_port, config.start_timeout).await {
            // Whatever went wrong, the failed start must not leak a child.
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = tokio::fs::remove_file(&config_path).await;
            return Err(e);
        }

        info!(
            "Tunnel adapter ready: {} -> socks5://127.0.0.1:{}",
            spec.canonical(),
            local_port
        );

        Ok(Self::supervise(child, local_port, config_path, config.grace_period))
    }

    /// Take ownership of a running child and watch it until close or exit.
    pub(crate) fn supervise(
        child: Child,
        local_port: u16,
        config_path: PathBuf,
        grace: Duration,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(supervisor_loop(
            child,
            local_port,
            config_path,
            grace,
            closed.clone(),
            cancel.clone(),
        ));

        Self {
            local_port,
            closed,
            cancel,
            supervisor: Mutex::new(Some(handle)),
        }
    }

    /// The endpoint a session should dial: `socks5://127.0.0.1:<port>`
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::local_socks5(self.local_port)
    }

    pub fn port(&self) -> u16 {
        self.local_port
    }

    /// False once the adapter was closed or its child died.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Terminate the child and release the port. Idempotent; safe to call
    /// from any task. Returns once the child has been reaped.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for TunnelAdapter {
    fn drop(&mut self) {
        // The supervisor owns the child; cancelling is enough to trigger
        // teardown even if close() was never awaited.
        self.cancel.cancel();
    }
}

/// Waits for either a close request or an unexpected child exit, then reaps.
async fn supervisor_loop(
    mut child: Child,
    local_port: u16,
    config_path: PathBuf,
    grace: Duration,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let exit_status = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };
    closed.store(true, Ordering::SeqCst);

    match exit_status {
        Some(Ok(status)) => warn!(
            "Tunnel process on port {} exited unexpectedly ({})",
            local_port, status
        ),
        Some(Err(e)) => warn!("Tunnel process on port {} wait failed: {}", local_port, e),
        None => {
            shutdown_child(&mut child, grace).await;
            debug!("Tunnel adapter on port {} closed", local_port);
        }
    }

    let _ = tokio::fs::remove_file(&config_path).await;
}

/// SIGTERM, bounded grace, then SIGKILL and reap.
async fn shutdown_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!("Tunnel process {} ignored SIGTERM, killing", pid);
    }

    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill().await;
}

/// Probe-connect the SOCKS5 port until the child answers or the timeout
/// elapses. A child that dies first fails fast instead of burning the
/// whole timeout.
async fn wait_until_accepting(
    child: &mut Child,
    port: u16,
    timeout: Duration,
) -> Result<(), AdapterError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return Err(AdapterError::EarlyExit(status.to_string()));
        }

        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(AdapterError::StartTimeout {
                port,
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        tokio::time::sleep(READY_PROBE_INTERVAL).await;
    }
}

/// Reserve a free loopback TCP port by binding port 0 and reading back the
/// assignment. The listener is dropped before the child spawns; the OS
/// keeps the number out of rotation long enough in practice.
fn allocate_free_port() -> Result<u16, AdapterError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Write the generated config under the crate's temp dir with a unique name.
async fn write_config_file(spec: &TunnelSpec, local_port: u16) -> Result<PathBuf, AdapterError> {
    let dir = std::env::temp_dir().join("fleet-crawler");
    tokio::fs::create_dir_all(&dir).await?;

    let path = dir.join(format!("tunnel-{}.json", Uuid::new_v4()));
    let config = build_tunnel_config(spec, local_port);
    tokio::fs::write(&path, serde_json::to_vec_pretty(&config)?).await?;
    Ok(path)
}

impl From<serde_json::Error> for AdapterError {
    fn from(e: serde_json::Error) -> Self {
        AdapterError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> TunnelSpec {
        TunnelSpec::parse("vless://uuid@127.0.0.1:62000?security=tls&sni=example.com").unwrap()
    }

    #[test]
    fn test_allocate_free_port_is_bindable_again() {
        let port = allocate_free_port().unwrap();
        assert!(port > 0);
        // The reservation is released with the probe listener
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[tokio::test]
    async fn test_start_with_missing_binary() {
        let config = AdapterConfig {
            binary_path: PathBuf::from("/nonexistent/tunnel-binary"),
            ..Default::default()
        };
        let err = TunnelAdapter::start(&test_spec(), &config).await.unwrap_err();
        assert!(matches!(err, AdapterError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_start_timeout_when_child_never_listens() {
        // `yes` happily ignores its arguments and runs forever without
        // ever opening the SOCKS5 port
        let config = AdapterConfig {
            binary_path: PathBuf::from("yes"),
            start_timeout: Duration::from_millis(400),
            grace_period: Duration::from_millis(200),
        };
        let err = TunnelAdapter::start(&test_spec(), &config).await.unwrap_err();
        assert!(matches!(err, AdapterError::StartTimeout { .. }));
    }

    #[tokio::test]
    async fn test_early_exit_is_reported() {
        // `true` exits immediately, well before the timeout
        let config = AdapterConfig {
            binary_path: PathBuf::from("true"),
            start_timeout: Duration::from_secs(5),
            grace_period: Duration::from_millis(200),
        };
        let err = TunnelAdapter::start(&test_spec(), &config).await.unwrap_err();
        assert!(matches!(err, AdapterError::EarlyExit(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_reaps_child() {
        let port = allocate_free_port().unwrap();
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let config_path = std::env::temp_dir().join(format!("tunnel-test-{}.json", Uuid::new_v4()));
        std::fs::write(&config_path, b"{}").unwrap();

        let adapter =
            TunnelAdapter::supervise(child, port, config_path.clone(), Duration::from_millis(500));
        assert!(adapter.is_alive());
        assert_eq!(adapter.endpoint().canonical(), format!("socks5://127.0.0.1:{port}"));

        adapter.close().await;
        assert!(!adapter.is_alive());
        assert!(!config_path.exists());

        // Second close is a no-op
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_unexpected_child_exit_marks_adapter_dead() {
        let port = allocate_free_port().unwrap();
        let child = Command::new("sleep")
            .arg("0.1")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let config_path = std::env::temp_dir().join(format!("tunnel-test-{}.json", Uuid::new_v4()));
        std::fs::write(&config_path, b"{}").unwrap();

        let adapter =
            TunnelAdapter::supervise(child, port, config_path, Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!adapter.is_alive());
    }
}
