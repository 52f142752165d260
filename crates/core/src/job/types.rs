//! Job records and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a job is in its lifecycle.
///
/// Queued, Running and Restarting are runnable; the rest are terminal and
/// always carry a reason or summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its first session.
    Queued,

    /// A session is in flight (or was, before a restart of the service).
    Running {
        identity: String,
        /// 1-based session number.
        session: u32,
        started_at: DateTime<Utc>,
    },

    /// Between sessions; the next tick starts a fresh one.
    Restarting {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_identity: Option<String>,
        since: DateTime<Utc>,
    },

    Completed {
        summary: String,
        completed_at: DateTime<Utc>,
    },

    Failed {
        reason: String,
        failed_at: DateTime<Utc>,
    },

    Cancelled {
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::Failed { .. } | JobState::Cancelled { .. }
        )
    }

    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns the state type as a string (for filtering).
    pub fn state_type(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running { .. } => "running",
            JobState::Restarting { .. } => "restarting",
            JobState::Completed { .. } => "completed",
            JobState::Failed { .. } => "failed",
            JobState::Cancelled { .. } => "cancelled",
        }
    }

    /// Reason or summary attached to the state, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            JobState::Restarting { reason, .. }
            | JobState::Failed { reason, .. }
            | JobState::Cancelled { reason, .. } => Some(reason),
            JobState::Completed { summary, .. } => Some(summary),
            JobState::Queued | JobState::Running { .. } => None,
        }
    }

    /// Identity the job last ran under.
    pub fn identity(&self) -> Option<&str> {
        match self {
            JobState::Running { identity, .. } => Some(identity),
            JobState::Restarting { last_identity, .. } => last_identity.as_deref(),
            _ => None,
        }
    }
}

/// State types a job can be claimed from.
pub const RUNNABLE_STATES: [&str; 3] = ["queued", "running", "restarting"];

/// A transfer from `source` to `destination` under identities of `domain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub source: String,
    pub destination: String,
    pub domain: String,
    pub dry_run: bool,
    pub requested_by: String,
    pub state: JobState,
    /// Never decreases.
    pub bytes_transferred: u64,
    pub sessions: u32,
    pub crash_count: u32,
    pub stall_count: u32,
    pub rotation_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub source: String,
    pub destination: String,
    pub domain: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_requested_by")]
    pub requested_by: String,
}

fn default_requested_by() -> String {
    "system".to_string()
}

impl EnqueueRequest {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            domain: domain.into(),
            dry_run: false,
            requested_by: default_requested_by(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_requested_by(mut self, user: impl Into<String>) -> Self {
        self.requested_by = user.into();
        self
    }
}

/// Per-job counters bumped by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCounter {
    Session,
    Crash,
    Stall,
    Rotation,
}

impl JobCounter {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            JobCounter::Session => "sessions",
            JobCounter::Crash => "crash_count",
            JobCounter::Stall => "stall_count",
            JobCounter::Rotation => "rotation_count",
        }
    }
}
