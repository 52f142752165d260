//! Directory-service client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for talking to the directory service and for provisioning retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Base URL of the directory REST API.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Command printing a bearer token on stdout.
    /// `{credentials}` and `{admin}` are replaced with the domain profile's
    /// credential path and admin address.
    #[serde(default)]
    pub token_command: Vec<String>,

    /// How long a minted token is reused (seconds).
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Upper bound for any single directory call, token minting included (seconds).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Attempts per directory call while provisioning before giving up.
    #[serde(default = "default_max_attempts")]
    pub provision_max_attempts: u32,

    /// First retry delay (milliseconds). Doubles per attempt.
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    /// Retry delay ceiling (milliseconds).
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Wait after account creation before adding it to the group (milliseconds).
    #[serde(default = "default_propagation_delay")]
    pub propagation_delay_ms: u64,

    /// Accounts that must never be deleted, even if asked to.
    #[serde(default)]
    pub protected_handles: Vec<String>,
}

fn default_api_base() -> String {
    "https://admin.googleapis.com".to_string()
}

fn default_token_ttl() -> u64 {
    3000
}

fn default_call_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_initial() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_propagation_delay() -> u64 {
    5000
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token_command: Vec::new(),
            token_ttl_secs: default_token_ttl(),
            call_timeout_secs: default_call_timeout(),
            provision_max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            propagation_delay_ms: default_propagation_delay(),
            protected_handles: Vec::new(),
        }
    }
}

impl DirectoryConfig {
    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1), capped.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt - 1);
        let delay = self.backoff_initial_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn propagation_delay(&self) -> Duration {
        Duration::from_millis(self.propagation_delay_ms)
    }

    pub fn is_protected(&self, handle: &str) -> bool {
        self.protected_handles
            .iter()
            .any(|p| p.eq_ignore_ascii_case(handle))
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.provision_max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.backoff_initial_ms = initial_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    pub fn with_propagation_delay_ms(mut self, delay_ms: u64) -> Self {
        self.propagation_delay_ms = delay_ms;
        self
    }

    pub fn with_protected_handle(mut self, handle: impl Into<String>) -> Self {
        self.protected_handles.push(handle.into());
        self
    }
}
