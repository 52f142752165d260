//! Directory-service client trait and error taxonomy.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::DomainProfile;

/// Failure reported by a directory-service call.
///
/// Kinds are distinct so callers can choose between retrying and failing fast.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory authentication failed: {0}")]
    Auth(String),

    #[error("directory rate limit hit: {0}")]
    RateLimited(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("directory call timed out after {0}s")]
    Timeout(u64),

    #[error("directory error: {0}")]
    Other(String),
}

impl DirectoryError {
    /// Transient failures worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DirectoryError::RateLimited(_) | DirectoryError::Unavailable(_) | DirectoryError::Timeout(_)
        )
    }

    /// Short label for metrics and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            DirectoryError::Auth(_) => "auth",
            DirectoryError::RateLimited(_) => "rate_limited",
            DirectoryError::NotFound(_) => "not_found",
            DirectoryError::AlreadyExists(_) => "already_exists",
            DirectoryError::Unavailable(_) => "unavailable",
            DirectoryError::Timeout(_) => "timeout",
            DirectoryError::Other(_) => "other",
        }
    }
}

/// Account and group management in the destination's directory.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Create a temporary account. Returns the handle the directory assigned.
    async fn create_account(
        &self,
        profile: &DomainProfile,
        handle: &str,
    ) -> Result<String, DirectoryError>;

    /// Delete an account.
    async fn delete_account(
        &self,
        profile: &DomainProfile,
        handle: &str,
    ) -> Result<(), DirectoryError>;

    /// Add an account to a group.
    async fn add_member(
        &self,
        profile: &DomainProfile,
        group: &str,
        handle: &str,
    ) -> Result<(), DirectoryError>;

    /// Remove an account from a group.
    async fn remove_member(
        &self,
        profile: &DomainProfile,
        group: &str,
        handle: &str,
    ) -> Result<(), DirectoryError>;

    /// Lightweight read proving credentials and connectivity work.
    async fn check_connection(&self, profile: &DomainProfile) -> Result<(), DirectoryError>;
}
