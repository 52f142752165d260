use thiserror::Error;

use super::{IdentityState, IdentityStoreError};
use crate::directory::DirectoryError;

/// Errors from identity lifecycle operations other than provisioning.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity not found: {0}")]
    NotFound(String),

    #[error("identity {handle} cannot move from {from} to {to}")]
    InvalidTransition {
        handle: String,
        from: IdentityState,
        to: IdentityState,
    },

    #[error("no domain profile named '{0}'")]
    UnknownDomain(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("identity store error: {0}")]
    Store(String),
}

impl From<IdentityStoreError> for IdentityError {
    fn from(e: IdentityStoreError) -> Self {
        match e {
            IdentityStoreError::NotFound(handle) => IdentityError::NotFound(handle),
            other => IdentityError::Store(other.to_string()),
        }
    }
}

/// Failure to hand out an active identity.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("identity pool for {domain} is exhausted ({limit} live identities)")]
    PoolExhausted { domain: String, limit: usize },

    #[error("provisioning for {domain} failed during {operation} after {attempts} attempt(s): {source}")]
    Directory {
        domain: String,
        operation: &'static str,
        attempts: u32,
        #[source]
        source: DirectoryError,
    },

    #[error("identity store error: {0}")]
    Store(String),
}

impl ProvisionError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::PoolExhausted { .. } => "pool_exhausted",
            ProvisionError::Directory { source, .. } => source.kind(),
            ProvisionError::Store(_) => "store",
        }
    }
}

impl From<IdentityStoreError> for ProvisionError {
    fn from(e: IdentityStoreError) -> Self {
        ProvisionError::Store(e.to_string())
    }
}
