use chrono::{DateTime, Utc};
use thiserror::Error;

use super::AuditRecord;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Page size when none is given.
pub const DEFAULT_AUDIT_PAGE: i64 = 100;

/// Narrows an audit query. Unset fields match everything; set fields are
/// ANDed together.
#[derive(Debug, Clone)]
pub struct AuditFilter {
    pub job_id: Option<String>,
    /// Exact identity handle
    pub identity: Option<String>,
    /// Every identity of a domain (handles ending in `@<domain>`)
    pub domain: Option<String>,
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for AuditFilter {
    fn default() -> Self {
        Self {
            job_id: None,
            identity: None,
            domain: None,
            event_type: None,
            user_id: None,
            from: None,
            to: None,
            limit: DEFAULT_AUDIT_PAGE,
            offset: 0,
        }
    }
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_identity(mut self, handle: impl Into<String>) -> Self {
        self.identity = Some(handle.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_time_range(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.from = from;
        self.to = to;
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

/// Append-only history of jobs, sessions and identities. Records are never
/// updated or deleted, so history outlives retired identities.
pub trait AuditStore: Send + Sync {
    /// Returns the assigned row id.
    fn insert(&self, record: &AuditRecord) -> Result<i64, AuditError>;

    /// Newest first, paged by `limit`/`offset`.
    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError>;

    /// Ignores `limit`/`offset`.
    fn count(&self, filter: &AuditFilter) -> Result<i64, AuditError>;
}
