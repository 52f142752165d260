//! Identity storage trait and types.

use std::fmt;

use super::{Identity, IdentityState};

/// Error type for identity storage.
#[derive(Debug)]
pub enum IdentityStoreError {
    /// No record with this handle.
    NotFound(String),
    /// A record with this handle already exists.
    Duplicate(String),
    /// Database error.
    Database(String),
}

impl fmt::Display for IdentityStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityStoreError::NotFound(handle) => write!(f, "Identity not found: {}", handle),
            IdentityStoreError::Duplicate(handle) => {
                write!(f, "Identity already exists: {}", handle)
            }
            IdentityStoreError::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for IdentityStoreError {}

/// Filter for listing identities.
#[derive(Debug, Clone, Default)]
pub struct IdentityFilter {
    /// Restrict to one domain.
    pub domain: Option<String>,
    /// Restrict to these states. Empty means any.
    pub states: Vec<IdentityState>,
}

impl IdentityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_state(mut self, state: IdentityState) -> Self {
        self.states.push(state);
        self
    }

    /// Provisioning, Active and Retiring.
    pub fn live(self) -> Self {
        self.with_state(IdentityState::Provisioning)
            .with_state(IdentityState::Active)
            .with_state(IdentityState::Retiring)
    }

    pub fn matches(&self, identity: &Identity) -> bool {
        self.domain.as_deref().is_none_or(|d| d == identity.domain)
            && (self.states.is_empty() || self.states.contains(&identity.state))
    }
}

/// Trait for identity storage backends.
///
/// Only the identity manager writes through this trait.
pub trait IdentityStore: Send + Sync {
    /// Insert a new record.
    fn insert(&self, identity: &Identity) -> Result<(), IdentityStoreError>;

    /// Get a record by handle.
    fn get(&self, handle: &str) -> Result<Option<Identity>, IdentityStoreError>;

    /// List records matching the filter, oldest first.
    fn list(&self, filter: &IdentityFilter) -> Result<Vec<Identity>, IdentityStoreError>;

    /// Overwrite an existing record.
    fn update(&self, identity: &Identity) -> Result<(), IdentityStoreError>;

    /// Remove a record. Returns false if it did not exist.
    fn delete(&self, handle: &str) -> Result<bool, IdentityStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let mut identity = Identity::new("a@example.com", "example.com", now);
        identity.state = IdentityState::Active;

        assert!(IdentityFilter::new().matches(&identity));
        assert!(IdentityFilter::new()
            .with_domain("example.com")
            .matches(&identity));
        assert!(!IdentityFilter::new().with_domain("other.org").matches(&identity));
        assert!(IdentityFilter::new().live().matches(&identity));
        assert!(!IdentityFilter::new()
            .with_state(IdentityState::Failed)
            .matches(&identity));
    }
}
