//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Start the background loop with the server.
    /// When disabled, it can still be started via API.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How often to look for runnable jobs (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Sessions in flight across all domains. One per domain regardless.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,

    /// Crashed sessions tolerated per job before it fails.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Identity rotations allowed per job (0 = unlimited).
    #[serde(default = "default_max_identities_per_job")]
    pub max_identities_per_job: u32,

    /// How long `stop` waits for interrupted sessions to wind down.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// When a session's identity reaches this percentage of the quota
    /// threshold, provision a standby identity for the domain in the
    /// background so the next rotation does not wait on the directory.
    /// Off when unset.
    #[serde(default)]
    pub standby_at_percent: Option<u8>,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    2000 // 2 seconds
}

fn default_max_concurrent_sessions() -> usize {
    4
}

fn default_max_restarts() -> u32 {
    3
}

fn default_max_identities_per_job() -> u32 {
    10
}

fn default_stop_timeout() -> u64 {
    30
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    pub fn with_max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }

    pub fn with_max_identities_per_job(mut self, max: u32) -> Self {
        self.max_identities_per_job = max;
        self
    }

    pub fn with_standby_at_percent(mut self, percent: u8) -> Self {
        self.standby_at_percent = Some(percent);
        self
    }

    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            poll_interval_ms: default_poll_interval(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            max_restarts: default_max_restarts(),
            max_identities_per_job: default_max_identities_per_job(),
            stop_timeout_secs: default_stop_timeout(),
            standby_at_percent: None,
        }
    }
}
