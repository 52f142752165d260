//! Identity records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a temporary transfer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    /// Account creation in progress.
    Provisioning,
    /// Created, group member, usable for transfers.
    Active,
    /// Teardown requested or in progress.
    Retiring,
    /// Account deleted directory-side.
    Retired,
    /// Unrecoverable directory error. Kept for diagnosis.
    Failed,
}

impl IdentityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityState::Provisioning => "provisioning",
            IdentityState::Active => "active",
            IdentityState::Retiring => "retiring",
            IdentityState::Retired => "retired",
            IdentityState::Failed => "failed",
        }
    }

    /// Counts against the domain's pool size limit.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            IdentityState::Provisioning | IdentityState::Active | IdentityState::Retiring
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IdentityState::Retired | IdentityState::Failed)
    }

    pub fn can_transition_to(&self, next: IdentityState) -> bool {
        use IdentityState::*;
        match (self, next) {
            (Provisioning, Active) | (Provisioning, Retiring) => true,
            (Active, Retiring) => true,
            (Retiring, Retired) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for IdentityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(IdentityState::Provisioning),
            "active" => Ok(IdentityState::Active),
            "retiring" => Ok(IdentityState::Retiring),
            "retired" => Ok(IdentityState::Retired),
            "failed" => Ok(IdentityState::Failed),
            other => Err(format!("unknown identity state: {}", other)),
        }
    }
}

/// One temporary transfer account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Generated account address, unique across domains.
    pub handle: String,
    /// Owning domain profile name.
    pub domain: String,
    pub state: IdentityState,
    /// Bytes moved in the current quota window.
    pub cumulative_bytes: u64,
    pub window_started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last directory error, set when the identity failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Identity {
    /// A fresh record in `Provisioning` with an empty window starting at `now`.
    pub fn new(handle: impl Into<String>, domain: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            handle: handle.into(),
            domain: domain.into(),
            state: IdentityState::Provisioning,
            cumulative_bytes: 0,
            window_started_at: now,
            created_at: now,
            updated_at: now,
            failure_reason: None,
        }
    }

    /// Move to `next`, rejecting edges the lifecycle does not allow.
    pub fn transition(
        &mut self,
        next: IdentityState,
        now: DateTime<Utc>,
    ) -> Result<(), (IdentityState, IdentityState)> {
        if !self.state.can_transition_to(next) {
            return Err((self.state, next));
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}
