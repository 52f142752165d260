//! Configuration for the transfer tool driver.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the transfer tool is launched and supervised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Path to the transfer tool binary.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Tool subcommand (`copy`, `sync`, `move`).
    #[serde(default = "default_command")]
    pub command: String,

    /// Parallel file transfers.
    #[serde(default = "default_transfers")]
    pub transfers: u32,

    /// Upload chunk size passed to the tool verbatim.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: String,

    /// How often the tool prints statistics.
    #[serde(default = "default_stats_interval")]
    pub stats_interval: String,

    /// Appended after the built-in flags.
    #[serde(default)]
    pub extra_flags: Vec<String>,

    /// Silence longer than this kills the session as stalled.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    #[serde(default = "default_stall_poll_interval")]
    pub stall_poll_interval_ms: u64,

    /// Bound on waiting for the process to exit after its output closes.
    #[serde(default = "default_exit_timeout")]
    pub exit_timeout_secs: u64,

    /// Regex with one capture group holding the cumulative transferred size.
    #[serde(default)]
    pub progress_pattern: Option<String>,

    /// Run the tool on a remote host.
    #[serde(default)]
    pub ssh: Option<SshConfig>,
}

fn default_binary() -> PathBuf {
    PathBuf::from("rclone")
}

fn default_command() -> String {
    "copy".to_string()
}

fn default_transfers() -> u32 {
    8
}

fn default_chunk_size() -> String {
    "128M".to_string()
}

fn default_stats_interval() -> String {
    "1s".to_string()
}

fn default_stall_timeout() -> u64 {
    600
}

fn default_stall_poll_interval() -> u64 {
    5000
}

fn default_exit_timeout() -> u64 {
    30
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            command: default_command(),
            transfers: default_transfers(),
            chunk_size: default_chunk_size(),
            stats_interval: default_stats_interval(),
            extra_flags: Vec::new(),
            stall_timeout_secs: default_stall_timeout(),
            stall_poll_interval_ms: default_stall_poll_interval(),
            exit_timeout_secs: default_exit_timeout(),
            progress_pattern: None,
            ssh: None,
        }
    }
}

impl TransferConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn stall_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stall_poll_interval_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_stall_timeout_secs(mut self, secs: u64) -> Self {
        self.stall_timeout_secs = secs;
        self
    }

    pub fn with_ssh(mut self, ssh: SshConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }
}

/// How `host` is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshMode {
    /// `user`, `host` and `key_path` are passed to ssh explicitly.
    #[default]
    Explicit,
    /// `host` is an alias from the ssh client config; other fields ignored.
    Alias,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub mode: SshMode,
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}
