//! Types for the job scheduler.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::job::{JobState, JobStoreError};
use crate::transfer::SessionOutcome;

/// Errors that can occur while scheduling.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the job's current state.
    #[error("job {job_id} is {state}; cannot {operation}")]
    InvalidState {
        job_id: String,
        state: String,
        operation: String,
    },

    #[error("unknown domain: {0}")]
    UnknownDomain(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
}

/// A session in flight, as reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSession {
    pub job_id: String,
    pub domain: String,
    /// Unset while the identity is still being acquired.
    pub identity: Option<String>,
    pub claimed_at: DateTime<Utc>,
    /// Bytes accounted in this session so far.
    pub session_bytes: u64,
    pub speed: Option<String>,
}

/// Current status of the scheduler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_sessions: Vec<ActiveSession>,
    pub queued_count: usize,
    pub running_count: usize,
    pub restarting_count: usize,
}

/// Result of advancing one job by one session.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub job_id: String,
    /// `None` when no session was launched (acquisition failed, job
    /// cancelled before launch, rotation limit hit).
    pub session: Option<SessionOutcome>,
    pub session_bytes: u64,
    /// State the job was left in.
    pub state: JobState,
}
