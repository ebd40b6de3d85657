//! Dispatcher tuning knobs

use std::time::Duration;

/// Worker pool sizing, backoff policy, and mode flags.
///
/// Built once at startup and shared read-only with every worker.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent sessions
    pub threads: usize,
    /// Per-session target duration
    pub session_duration: Duration,
    /// Extra wall clock granted on top of the duration before a session
    /// is cut off and treated as timed out
    pub session_slack: Duration,
    /// Worker sleep when the pool has nothing idle
    pub no_proxy_backoff: Duration,
    /// Jittered penalty window after a failed session
    pub failure_backoff_min: Duration,
    pub failure_backoff_max: Duration,
    /// Jittered cooldown window after a completed session
    pub cooldown_min: Duration,
    pub cooldown_max: Duration,
    /// Delay before restarting after a duration-timeout session
    pub restart_delay: Duration,
    /// Stagger between worker spawns so adapter starts spread out
    pub start_jitter: Duration,
    /// How long shutdown waits for in-flight workers before aborting them
    pub grace_period: Duration,
    /// Schedule exactly `threads` sessions, then drain and stop
    pub run_once: bool,
    /// Skip the pool entirely and run sessions on the direct connection
    pub no_proxy_mode: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            threads: 10,
            session_duration: Duration::from_secs(30),
            session_slack: Duration::from_secs(15),
            no_proxy_backoff: Duration::from_secs(2),
            failure_backoff_min: Duration::from_secs(10),
            failure_backoff_max: Duration::from_secs(20),
            cooldown_min: Duration::from_secs(1),
            cooldown_max: Duration::from_secs(5),
            restart_delay: Duration::from_millis(100),
            start_jitter: Duration::from_millis(500),
            grace_period: Duration::from_secs(5),
            run_once: false,
            no_proxy_mode: false,
        }
    }
}

impl DispatcherConfig {
    /// Clamp nonsensical values instead of failing startup.
    pub fn normalized(mut self) -> Self {
        self.threads = self.threads.max(1);
        if self.failure_backoff_max < self.failure_backoff_min {
            self.failure_backoff_max = self.failure_backoff_min;
        }
        if self.cooldown_max < self.cooldown_min {
            self.cooldown_max = self.cooldown_min;
        }
        self
    }
}
