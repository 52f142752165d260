//! Quota configuration.

use serde::{Deserialize, Serialize};

use super::size::{deserialize_size, GIB};

/// Per-identity transfer quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Bytes one identity may move per window before it is rotated out.
    /// Accepts a byte count or a size string such as "700G".
    /// Kept below the destination's hard daily cap (750 GB) for margin.
    #[serde(default = "default_threshold", deserialize_with = "deserialize_size")]
    pub threshold: u64,

    /// Length of the quota window in hours.
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
}

fn default_threshold() -> u64 {
    700 * GIB
}

fn default_window_hours() -> u64 {
    24
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            window_hours: default_window_hours(),
        }
    }
}
