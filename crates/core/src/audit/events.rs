use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    // System events
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    ServiceStopped {
        reason: String,
    },
    /// Scheduler loop started or stopped from the dashboard.
    SchedulerToggled {
        user_id: String,
        running: bool,
    },

    // Job lifecycle
    JobEnqueued {
        job_id: String,
        requested_by: String,
        source: String,
        destination: String,
        domain: String,
        dry_run: bool,
    },
    JobStateChanged {
        job_id: String,
        from_state: String,
        to_state: String,
        reason: Option<String>,
    },
    JobCancelled {
        job_id: String,
        cancelled_by: String,
        reason: Option<String>,
        previous_state: String,
    },

    // Transfer sessions
    SessionStarted {
        job_id: String,
        identity: String,
        /// 1-based session number within the job
        attempt: u32,
    },
    SessionEnded {
        job_id: String,
        identity: String,
        /// "completed", "stalled", "crashed", "cancelled" or "launch_failed"
        outcome: String,
        /// Bytes accounted during this session only
        session_bytes: u64,
        duration_ms: u64,
        /// Tail of tool output for crashes
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostics: Option<String>,
    },

    // Identity lifecycle
    IdentityProvisioned {
        handle: String,
        domain: String,
    },
    IdentityRetired {
        handle: String,
        domain: String,
        /// Bytes counted in the final quota window
        cumulative_bytes: u64,
    },
    IdentityFailed {
        handle: String,
        domain: String,
        reason: String,
    },
    QuotaThresholdReached {
        handle: String,
        domain: String,
        cumulative_bytes: u64,
        threshold: u64,
    },
    ProvisionRetry {
        domain: String,
        handle: String,
        /// Directory operation that failed, e.g. "create_account"
        operation: String,
        attempt: u32,
        error: String,
    },

    // Manual overrides
    IdentityRetireRequested {
        user_id: String,
        handle: String,
        /// "retired", "already_retired" or "deferred"
        outcome: String,
    },
    IdentityProvisionRequested {
        user_id: String,
        domain: String,
        handle: Option<String>,
        error: Option<String>,
    },
}

impl AuditEvent {
    /// Returns the event type as a string for storage
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::SchedulerToggled { .. } => "scheduler_toggled",
            Self::JobEnqueued { .. } => "job_enqueued",
            Self::JobStateChanged { .. } => "job_state_changed",
            Self::JobCancelled { .. } => "job_cancelled",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionEnded { .. } => "session_ended",
            Self::IdentityProvisioned { .. } => "identity_provisioned",
            Self::IdentityRetired { .. } => "identity_retired",
            Self::IdentityFailed { .. } => "identity_failed",
            Self::QuotaThresholdReached { .. } => "quota_threshold_reached",
            Self::ProvisionRetry { .. } => "provision_retry",
            Self::IdentityRetireRequested { .. } => "identity_retire_requested",
            Self::IdentityProvisionRequested { .. } => "identity_provision_requested",
        }
    }

    /// Extract job_id if this event is job-related
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobEnqueued { job_id, .. }
            | Self::JobStateChanged { job_id, .. }
            | Self::JobCancelled { job_id, .. }
            | Self::SessionStarted { job_id, .. }
            | Self::SessionEnded { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    /// Extract the identity handle if this event concerns one
    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::SessionStarted { identity, .. } | Self::SessionEnded { identity, .. } => {
                Some(identity)
            }
            Self::IdentityProvisioned { handle, .. }
            | Self::IdentityRetired { handle, .. }
            | Self::IdentityFailed { handle, .. }
            | Self::QuotaThresholdReached { handle, .. }
            | Self::ProvisionRetry { handle, .. }
            | Self::IdentityRetireRequested { handle, .. } => Some(handle),
            Self::IdentityProvisionRequested { handle, .. } => handle.as_deref(),
            _ => None,
        }
    }

    /// Extract user_id if this event was triggered by a user action
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::JobEnqueued { requested_by, .. } => Some(requested_by),
            Self::JobCancelled { cancelled_by, .. } => Some(cancelled_by),
            Self::SchedulerToggled { user_id, .. }
            | Self::IdentityRetireRequested { user_id, .. }
            | Self::IdentityProvisionRequested { user_id, .. } => Some(user_id),
            _ => None,
        }
    }
}

/// A stored audit record with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub job_id: Option<String>,
    pub identity: Option<String>,
    pub user_id: Option<String>,
    pub data: AuditEvent,
}
