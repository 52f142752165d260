//! Job storage trait and types.

use std::fmt;

use super::{EnqueueRequest, Job, JobCounter, JobState};

/// Error type for job store operations.
#[derive(Debug)]
pub enum JobStoreError {
    NotFound(String),
    /// The job's current state does not allow the operation.
    InvalidState {
        job_id: String,
        current_state: String,
        operation: String,
    },
    Database(String),
}

impl fmt::Display for JobStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStoreError::NotFound(id) => write!(f, "Job not found: {}", id),
            JobStoreError::InvalidState {
                job_id,
                current_state,
                operation,
            } => write!(
                f,
                "Cannot {} job {}: current state is {}",
                operation, job_id, current_state
            ),
            JobStoreError::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for JobStoreError {}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// State type, e.g. "running".
    pub state: Option<String>,
    pub domain: Option<String>,
    /// Domains to leave out.
    pub exclude_domains: Vec<String>,
    /// Only Queued, Running and Restarting jobs.
    pub runnable: bool,
    pub limit: i64,
    pub offset: i64,
}

impl JobFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn excluding_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_domains.extend(domains.into_iter().map(Into::into));
        self
    }

    pub fn runnable(mut self) -> Self {
        self.runnable = true;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Persistence for jobs. Listing is oldest first.
pub trait JobStore: Send + Sync {
    fn create(&self, request: EnqueueRequest) -> Result<Job, JobStoreError>;

    fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError>;

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    fn count(&self, filter: &JobFilter) -> Result<i64, JobStoreError>;

    /// Replace the state. Terminal states are final: leaving one is
    /// `InvalidState`.
    fn update_state(&self, id: &str, state: JobState) -> Result<Job, JobStoreError>;

    /// Add transferred bytes; the total never decreases.
    fn add_bytes(&self, id: &str, delta: u64) -> Result<Job, JobStoreError>;

    fn increment_counter(&self, id: &str, counter: JobCounter) -> Result<Job, JobStoreError>;
}
