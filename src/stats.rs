//! Lock-free controller statistics
//!
//! Atomic counters shared between the dispatcher workers and whoever wants
//! a snapshot (logging, shutdown summary).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Counters aggregated across all workers
#[derive(Debug, Default)]
pub struct GlobalStats {
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_timed_out: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub active_workers: AtomicU64,
    pub start_time: AtomicU64,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self {
            start_time: AtomicU64::new(unix_now()),
            ..Default::default()
        }
    }

    /// Session ran to completion and the lease was released
    pub fn record_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Session failed and the lease was penalized
    pub fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Session hit its duration target; success-equivalent
    pub fn record_timed_out(&self) {
        self.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Worker found no idle proxy and backed off
    pub fn record_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_finished(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::Relaxed)
    }

    pub fn active_workers(&self) -> u64 {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Completed sessions per hour since startup
    pub fn completion_rate(&self) -> f64 {
        let elapsed_hours =
            (unix_now().saturating_sub(self.start_time.load(Ordering::Relaxed))) as f64 / 3600.0;
        if elapsed_hours < 0.001 {
            return 0.0;
        }
        self.completed() as f64 / elapsed_hours
    }

    /// Snapshot for serialization
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            completion_rate: self.completion_rate(),
        }
    }
}

/// Serializable snapshot of the global counters
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub pool_exhausted: u64,
    pub active_workers: u64,
    pub completion_rate: f64,
}
