//! Exclusive-lease proxy pool
//!
//! All state transitions are serialized by one mutex. Adapter starts are
//! the slow path and run outside the lock: acquire optimistically marks
//! the record leased, releases the lock, starts the adapter, then
//! re-locks to commit or roll back. Acquire itself never blocks a worker
//! on another worker's adapter start.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::record::{Lease, ProxyOrigin, ProxyRecord, RecordState};
use crate::tunnel::{AdapterConfig, TunnelAdapter};

/// Errors surfaced by pool persistence
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pool sizing and failure policy
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target working-set size; surplus candidates queue in the reserve
    pub min_pool_size: usize,
    /// Failures beyond this count retire a record
    pub max_failures: u32,
    /// Tunnel adapter settings used when materializing tunnel records
    pub adapter: AdapterConfig,
    /// Fixed RNG seed for reproducible selection in tests
    pub rng_seed: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 20,
            max_failures: 3,
            adapter: AdapterConfig::default(),
            rng_seed: None,
        }
    }
}

struct PoolInner {
    working: Vec<ProxyRecord>,
    reserve: VecDeque<ProxyOrigin>,
    retired: HashSet<String>,
    rng: StdRng,
    next_token: u64,
}

impl PoolInner {
    fn contains(&self, key: &str) -> bool {
        self.retired.contains(key)
            || self.working.iter().any(|r| r.canonical() == key)
            || self.reserve.iter().any(|o| o.canonical() == key)
    }

    fn record_mut(&mut self, key: &str) -> Option<&mut ProxyRecord> {
        self.working.iter_mut().find(|r| r.canonical() == key)
    }

    /// Move one reserve candidate into the working set. Called after every
    /// retirement so the working set converges back toward its target.
    fn replenish(&mut self) {
        while let Some(origin) = self.reserve.pop_front() {
            let key = origin.canonical();
            if self.retired.contains(&key)
                || self.working.iter().any(|r| r.canonical() == key)
            {
                continue;
            }
            debug!("Replenishing working set with {}", key);
            self.working.push(ProxyRecord::new(origin));
            return;
        }
    }

    /// Retire the record at `index` and try to backfill its slot.
    fn retire_at(&mut self, index: usize) {
        let mut record = self.working.remove(index);
        record.state = RecordState::Retired;
        let key = record.canonical();
        info!(
            "Retiring proxy {} after {} failures",
            key, record.failure_count
        );
        self.retired.insert(key);
        self.replenish();
    }
}

/// Thread-safe pool of proxy records with exclusive leases.
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
    min_pool_size: usize,
    max_failures: u32,
    adapter_config: AdapterConfig,
}

impl ProxyPool {
    /// Commit a freshly-started adapter onto the record that reserved it,
    /// provided the lease is still the one that requested it. Synchronous
    /// and lock-scoped so the guard never crosses an await point.
    fn try_attach_adapter(&self, key: &str, token: u64, adapter: &Arc<TunnelAdapter>) -> bool {
        let mut inner = self.inner.lock();
        match inner.record_mut(key) {
            Some(record) if record.lease_token == token && record.state == RecordState::Leased => {
                record.adapter = Some(adapter.clone());
                true
            }
            _ => false,
        }
    }

    pub fn new(config: PoolConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            inner: Mutex::new(PoolInner {
                working: Vec::new(),
                reserve: VecDeque::new(),
                retired: HashSet::new(),
                rng,
                next_token: 0,
            }),
            min_pool_size: config.min_pool_size,
            max_failures: config.max_failures,
            adapter_config: config.adapter,
        }
    }

    /// Parse and insert candidate strings. Unparseable lines are dropped
    /// with a debug record; duplicates (including retired keys) are
    /// skipped. Returns how many records were actually added.
    pub fn add_candidates<I, S>(&self, candidates: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.inner.lock();
        let mut added = 0;

        for candidate in candidates {
            let line = candidate.as_ref().trim();
            if line.is_empty() {
                continue;
            }

            let origin = match ProxyOrigin::parse(line) {
                Ok(origin) => origin,
                Err(e) => {
                    debug!("Dropping malformed proxy candidate: {}", e);
                    continue;
                }
            };

            let key = origin.canonical();
            if inner.contains(&key) {
                continue;
            }

            if inner.working.len() < self.min_pool_size {
                inner.working.push(ProxyRecord::new(origin));
            } else {
                inner.reserve.push_back(origin);
            }
            added += 1;
        }

        added
    }

    /// Append candidates from a newline-delimited file. A missing file is
    /// treated as empty input.
    pub async fn load_from_file(&self, path: impl AsRef<Path>) -> Result<usize, PoolError> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Proxy list {} not found, skipping", path.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let added = self.add_candidates(content.lines());
        info!("Loaded {} proxies from {}", added, path.display());
        Ok(added)
    }

    /// Lease an idle record, materializing a tunnel adapter when needed.
    ///
    /// Selection is uniformly random among idle records. A record whose
    /// adapter fails to start is penalized and the next idle record is
    /// tried — at most once per call across all records — then `None`.
    /// Returns `None` when nothing idle is left; never blocks waiting
    /// for one.
    pub async fn acquire(&self) -> Option<Lease> {
        let mut failed_start: Option<String> = None;

        // Initial attempt plus one retry. A run of broken tunnel records
        // must not stall the caller for a working set's worth of start
        // timeouts.
        for _ in 0..2 {
            // Reserve a random idle record under the lock
            let (origin, key, token) = {
                let mut inner = self.inner.lock();
                let idle: Vec<usize> = inner
                    .working
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| {
                        r.state == RecordState::Idle
                            && failed_start.as_deref() != Some(r.canonical().as_str())
                    })
                    .map(|(i, _)| i)
                    .collect();

                if idle.is_empty() {
                    return None;
                }

                let index = idle[inner.rng.gen_range(0..idle.len())];
                inner.next_token += 1;
                let token = inner.next_token;

                let record = &mut inner.working[index];
                record.state = RecordState::Leased;
                record.lease_token = token;
                (record.origin.clone(), record.canonical(), token)
            };

            let spec = match origin {
                ProxyOrigin::Raw(endpoint) => {
                    debug!("Leased proxy {}", key);
                    return Some(Lease::new(key, token, endpoint, None));
                }
                ProxyOrigin::Tunnel(spec) => spec,
            };

            // Slow path: adapter start happens with the lock released so
            // other workers can keep acquiring.
            match TunnelAdapter::start(&spec, &self.adapter_config).await {
                Ok(adapter) => {
                    let adapter = Arc::new(adapter);
                    let endpoint = adapter.endpoint();

                    let attached = self.try_attach_adapter(&key, token, &adapter);

                    if attached {
                        debug!("Leased tunnel {} via {}", key, endpoint);
                        return Some(Lease::new(key, token, endpoint, Some(adapter)));
                    } else {
                        // Record vanished while we were starting the
                        // adapter; tear the orphan down and move on.
                        adapter.close().await;
                    }
                }
                Err(e) => {
                    warn!("Tunnel adapter start failed for {}: {}", key, e);

                    let mut inner = self.inner.lock();
                    if let Some(index) = inner.working.iter().position(|r| {
                        r.canonical() == key
                            && r.lease_token == token
                            && r.state == RecordState::Leased
                    }) {
                        let record = &mut inner.working[index];
                        record.state = RecordState::Idle;
                        record.failure_count += 1;
                        if record.failure_count > self.max_failures {
                            inner.retire_at(index);
                        }
                    }
                    failed_start = Some(key);
                }
            }
        }

        None
    }

    /// Return a lease after a successful session: the record goes back to
    /// idle with a clean failure history. Stale or unknown leases are
    /// no-ops.
    pub async fn release(&self, lease: Lease) {
        let adapter = {
            let mut inner = self.inner.lock();
            match inner.record_mut(&lease.key) {
                Some(record)
                    if record.lease_token == lease.token
                        && record.state == RecordState::Leased =>
                {
                    record.state = RecordState::Idle;
                    record.failure_count = 0;
                    record.adapter.take()
                }
                _ => None,
            }
        };

        if let Some(adapter) = adapter {
            adapter.close().await;
        } else if let Some(adapter) = lease.adapter {
            // Stale lease can still hold the last reference to a live child
            adapter.close().await;
        }
    }

    /// Return a lease after a failed session. The record is penalized and
    /// retired once its failure count exceeds the policy limit; every
    /// retirement pulls one reserve candidate into the working set.
    pub async fn mark_failed(&self, lease: Lease) {
        let adapter = {
            let mut inner = self.inner.lock();
            let index = inner.working.iter().position(|r| {
                r.canonical() == lease.key
                    && r.lease_token == lease.token
                    && r.state == RecordState::Leased
            });
            match index {
                Some(index) => {
                    let record = &mut inner.working[index];
                    record.state = RecordState::Idle;
                    record.failure_count += 1;
                    let adapter = record.adapter.take();
                    if record.failure_count > self.max_failures {
                        inner.retire_at(index);
                    }
                    adapter
                }
                None => None,
            }
        };

        if let Some(adapter) = adapter {
            adapter.close().await;
        } else if let Some(adapter) = lease.adapter {
            adapter.close().await;
        }
    }

    /// Count of working-set records (idle + leased)
    pub fn size(&self) -> usize {
        self.inner.lock().working.len()
    }

    /// Count of reserve candidates waiting to enter the working set
    pub fn reserve_size(&self) -> usize {
        self.inner.lock().reserve.len()
    }

    /// Count of retired keys
    pub fn retired_size(&self) -> usize {
        self.inner.lock().retired.len()
    }

    /// Rewrite the raw proxy list: every non-retired raw record, working
    /// set first, then reserve.
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), PoolError> {
        let lines = self.collect_lines(false);
        self.write_lines(path.as_ref(), lines).await
    }

    /// Rewrite the tunnel URI list with every non-retired tunnel record.
    pub async fn save_tunnels_to_file(&self, path: impl AsRef<Path>) -> Result<(), PoolError> {
        let lines = self.collect_lines(true);
        self.write_lines(path.as_ref(), lines).await
    }

    fn collect_lines(&self, tunnels: bool) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .working
            .iter()
            .map(|r| &r.origin)
            .chain(inner.reserve.iter())
            .filter(|o| o.is_tunnel() == tunnels)
            .map(|o| o.display_string())
            .collect()
    }

    async fn write_lines(&self, path: &Path, lines: Vec<String>) -> Result<(), PoolError> {
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        tokio::fs::write(path, content).await?;
        info!("Saved {} entries to {}", lines.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(config: PoolConfig, candidates: &[&str]) -> ProxyPool {
        let pool = ProxyPool::new(config);
        pool.add_candidates(candidates.iter().copied());
        pool
    }

    fn seeded_config() -> PoolConfig {
        PoolConfig {
            rng_seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_candidates_dedupes_and_drops_malformed() {
        let pool = ProxyPool::new(seeded_config());
        let added = pool.add_candidates([
            "1.1.1.1:8080",
            "1.1.1.1:8080",
            "http://1.1.1.1:8080",
            "not a proxy",
            "",
            "2.2.2.2:8080:user:pass",
        ]);
        assert_eq!(added, 2);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_overflow_goes_to_reserve() {
        let config = PoolConfig {
            min_pool_size: 2,
            ..seeded_config()
        };
        let pool = pool_with(config, &["1.1.1.1:1", "2.2.2.2:2", "3.3.3.3:3", "4.4.4.4:4"]);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.reserve_size(), 2);
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let pool = pool_with(seeded_config(), &["1.1.1.1:8080"]);

        let first = pool.acquire().await;
        assert!(first.is_some());
        assert!(pool.acquire().await.is_none());

        pool.release(first.unwrap()).await;
        assert!(pool.acquire().await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_record() {
        let pool = Arc::new(pool_with(seeded_config(), &["1.1.1.1:8080"]));

        let a = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        let b = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
    }

    #[tokio::test]
    async fn test_seeded_selection_is_deterministic() {
        let candidates = ["1.1.1.1:1", "2.2.2.2:2", "3.3.3.3:3"];

        let picks = |seed: u64| async move {
            let config = PoolConfig {
                rng_seed: Some(seed),
                ..Default::default()
            };
            let pool = pool_with(config, &candidates);
            let mut order = Vec::new();
            while let Some(lease) = pool.acquire().await {
                order.push(lease.endpoint().canonical());
            }
            order
        };

        assert_eq!(picks(42).await, picks(42).await);
    }

    #[tokio::test]
    async fn test_release_resets_failure_count() {
        let config = PoolConfig {
            max_failures: 3,
            ..seeded_config()
        };
        let pool = pool_with(config, &["1.1.1.1:8080"]);

        // Fail up to the limit, then succeed once
        for _ in 0..3 {
            let lease = pool.acquire().await.unwrap();
            pool.mark_failed(lease).await;
        }
        let lease = pool.acquire().await.unwrap();
        pool.release(lease).await;

        // The reset means three more failures still do not retire it
        for _ in 0..3 {
            let lease = pool.acquire().await.unwrap();
            pool.mark_failed(lease).await;
        }
        assert_eq!(pool.size(), 1);

        // One past the limit finally does
        let lease = pool.acquire().await.unwrap();
        pool.mark_failed(lease).await;
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.retired_size(), 1);
    }

    #[tokio::test]
    async fn test_retirement_replenishes_from_reserve() {
        let config = PoolConfig {
            min_pool_size: 1,
            max_failures: 0,
            ..seeded_config()
        };
        let pool = pool_with(config, &["1.1.1.1:1", "2.2.2.2:2"]);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.reserve_size(), 1);

        let lease = pool.acquire().await.unwrap();
        pool.mark_failed(lease).await;

        // 1.1.1.1 retired, 2.2.2.2 promoted
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.reserve_size(), 0);
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.endpoint().canonical(), "http://2.2.2.2:2");
    }

    #[tokio::test]
    async fn test_retired_key_never_re_enters() {
        let config = PoolConfig {
            max_failures: 0,
            ..seeded_config()
        };
        let pool = pool_with(config, &["1.1.1.1:8080"]);

        let lease = pool.acquire().await.unwrap();
        pool.mark_failed(lease).await;
        assert_eq!(pool.retired_size(), 1);

        assert_eq!(pool.add_candidates(["1.1.1.1:8080"]), 0);
        assert!(pool.acquire().await.is_none());
    }

    #[tokio::test]
    async fn test_stale_lease_is_noop() {
        let pool = pool_with(seeded_config(), &["1.1.1.1:8080"]);

        let lease = pool.acquire().await.unwrap();
        let stale = lease.clone();
        pool.mark_failed(lease).await;

        // The record was re-leased under a new token; the stale copy must
        // not disturb it
        let fresh = pool.acquire().await.unwrap();
        pool.release(stale.clone()).await;
        pool.mark_failed(stale).await;
        assert!(pool.acquire().await.is_none());

        pool.release(fresh).await;
        assert!(pool.acquire().await.is_some());
    }

    #[tokio::test]
    async fn test_acquire_on_empty_pool_returns_none() {
        let pool = ProxyPool::new(seeded_config());
        assert!(pool.acquire().await.is_none());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = std::env::temp_dir().join("fleet-crawler-tests");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(format!("proxies-{}.txt", uuid::Uuid::new_v4()));

        let pool = pool_with(seeded_config(), &["1.1.1.1:8080", "2.2.2.2:9090:user:pass"]);
        pool.save_to_file(&path).await.unwrap();

        let reloaded = ProxyPool::new(seeded_config());
        assert_eq!(reloaded.load_from_file(&path).await.unwrap(), 2);
        assert_eq!(reloaded.size(), 2);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let pool = ProxyPool::new(seeded_config());
        let added = pool
            .load_from_file("/nonexistent/fleet-crawler/proxies.txt")
            .await
            .unwrap();
        assert_eq!(added, 0);
    }

    #[tokio::test]
    async fn test_tunnel_records_persist_separately() {
        let pool = pool_with(
            seeded_config(),
            &["1.1.1.1:8080", "vless://uuid@5.5.5.5:443?security=tls&sni=example.com"],
        );

        let dir = std::env::temp_dir().join("fleet-crawler-tests");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(format!("vless-{}.txt", uuid::Uuid::new_v4()));

        pool.save_tunnels_to_file(&path).await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.starts_with("vless://uuid@5.5.5.5:443"));
        assert!(!content.contains("1.1.1.1"));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_adapter_start_failure_penalizes_record() {
        // A tunnel record whose binary does not exist cannot be leased;
        // acquire should fall through to the raw record instead.
        let config = PoolConfig {
            adapter: AdapterConfig {
                binary_path: "/nonexistent/tunnel-binary".into(),
                ..Default::default()
            },
            ..seeded_config()
        };
        let pool = pool_with(
            config,
            &["vless://uuid@5.5.5.5:443", "1.1.1.1:8080"],
        );

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.endpoint().canonical(), "http://1.1.1.1:8080");
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn test_adapter_start_failure_exhausts_to_none() {
        let config = PoolConfig {
            max_failures: 10,
            adapter: AdapterConfig {
                binary_path: "/nonexistent/tunnel-binary".into(),
                ..Default::default()
            },
            ..seeded_config()
        };
        let pool = pool_with(config, &["vless://uuid@5.5.5.5:443"]);

        assert!(pool.acquire().await.is_none());
        // The failed start left the record idle and penalized
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_adapter_start_retries_at_most_once() {
        // Three broken tunnel records: acquire gives up after the initial
        // attempt plus one retry instead of walking the whole working set
        let config = PoolConfig {
            max_failures: 0,
            adapter: AdapterConfig {
                binary_path: "/nonexistent/tunnel-binary".into(),
                ..Default::default()
            },
            ..seeded_config()
        };
        let pool = pool_with(
            config,
            &[
                "vless://uuid@5.5.5.5:443",
                "vless://uuid@6.6.6.6:443",
                "vless://uuid@7.7.7.7:443",
            ],
        );

        assert!(pool.acquire().await.is_none());
        // Exactly two records were attempted; the third was never touched
        assert_eq!(pool.retired_size(), 2);
        assert_eq!(pool.size(), 1);
    }
}
