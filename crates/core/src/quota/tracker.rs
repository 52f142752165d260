//! Byte accounting against the per-identity threshold.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::config::QuotaConfig;
use crate::identity::Identity;

/// Result of recording progress for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Ok,
    /// The identity crossed the threshold with this delta.
    /// Reported once per crossing.
    ThresholdReached,
}

/// Stateless quota accounting.
///
/// All state lives on the [`Identity`]; callers hand in a mutable record
/// and persist it afterwards.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    threshold: u64,
    window: Duration,
}

impl QuotaTracker {
    pub fn new(threshold: u64, window: Duration) -> Self {
        Self { threshold, window }
    }

    pub fn from_config(config: &QuotaConfig) -> Self {
        Self::new(
            config.threshold,
            Duration::hours(config.window_hours as i64),
        )
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Add `delta` bytes to the identity's window counter.
    ///
    /// Starts a fresh window first if the current one has elapsed.
    pub fn record_progress(
        &self,
        identity: &mut Identity,
        delta: u64,
        now: DateTime<Utc>,
    ) -> QuotaStatus {
        if self.window_expired(identity, now) {
            identity.cumulative_bytes = 0;
            identity.window_started_at = now;
        }

        let before = identity.cumulative_bytes;
        identity.cumulative_bytes = before.saturating_add(delta);

        if before < self.threshold && identity.cumulative_bytes >= self.threshold {
            QuotaStatus::ThresholdReached
        } else {
            QuotaStatus::Ok
        }
    }

    /// Whether the identity may no longer be handed out in its current window.
    pub fn is_exhausted(&self, identity: &Identity, now: DateTime<Utc>) -> bool {
        !self.window_expired(identity, now) && identity.cumulative_bytes >= self.threshold
    }

    /// Bytes left before the threshold in the current window.
    pub fn remaining(&self, identity: &Identity, now: DateTime<Utc>) -> u64 {
        if self.window_expired(identity, now) {
            return self.threshold;
        }
        self.threshold.saturating_sub(identity.cumulative_bytes)
    }

    fn window_expired(&self, identity: &Identity, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(identity.window_started_at) >= self.window
    }
}
