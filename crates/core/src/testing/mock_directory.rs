//! Mock directory service for testing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::DomainProfile;
use crate::directory::{DirectoryClient, DirectoryError};

#[derive(Debug, Default)]
struct DirectoryState {
    accounts: HashSet<String>,
    groups: HashMap<String, Vec<String>>,
    created: Vec<String>,
    deleted: Vec<String>,
    create_attempts: usize,
    create_failures: VecDeque<DirectoryError>,
    connection_error: Option<DirectoryError>,
}

/// In-memory implementation of the DirectoryClient trait.
///
/// Records account and membership changes for assertions and can be told
/// to fail upcoming calls.
///
/// # Example
///
/// ```rust,ignore
/// let directory = MockDirectoryClient::new();
/// directory
///     .fail_next_creates(vec![DirectoryError::RateLimited("429".into())])
///     .await;
///
/// // ... provision through the identity manager ...
///
/// assert_eq!(directory.create_attempts().await, 2);
/// assert_eq!(directory.created_accounts().await.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockDirectoryClient {
    state: Arc<RwLock<DirectoryState>>,
}

impl MockDirectoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts successfully created, in order.
    pub async fn created_accounts(&self) -> Vec<String> {
        self.state.read().await.created.clone()
    }

    /// Accounts successfully deleted, in order.
    pub async fn deleted_accounts(&self) -> Vec<String> {
        self.state.read().await.deleted.clone()
    }

    /// Current members of `group`.
    pub async fn members(&self, group: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .groups
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    /// Every create call, failed or not.
    pub async fn create_attempts(&self) -> usize {
        self.state.read().await.create_attempts
    }

    /// Make the next create calls fail with these errors, in order.
    pub async fn fail_next_creates(&self, errors: Vec<DirectoryError>) {
        self.state.write().await.create_failures.extend(errors);
    }

    /// Make `check_connection` fail (or succeed again with `None`).
    pub async fn set_connection_error(&self, error: Option<DirectoryError>) {
        self.state.write().await.connection_error = error;
    }

    /// Drop an account behind the caller's back, as if deleted out of band.
    pub async fn forget_account(&self, handle: &str) {
        let mut state = self.state.write().await;
        state.accounts.remove(handle);
        for members in state.groups.values_mut() {
            members.retain(|m| m != handle);
        }
    }
}

#[async_trait]
impl DirectoryClient for MockDirectoryClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_account(
        &self,
        _profile: &DomainProfile,
        handle: &str,
    ) -> Result<String, DirectoryError> {
        let mut state = self.state.write().await;
        state.create_attempts += 1;

        if let Some(error) = state.create_failures.pop_front() {
            return Err(error);
        }
        if !state.accounts.insert(handle.to_string()) {
            return Err(DirectoryError::AlreadyExists(handle.to_string()));
        }
        state.created.push(handle.to_string());
        Ok(handle.to_string())
    }

    async fn delete_account(
        &self,
        _profile: &DomainProfile,
        handle: &str,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        if !state.accounts.remove(handle) {
            return Err(DirectoryError::NotFound(handle.to_string()));
        }
        state.deleted.push(handle.to_string());
        Ok(())
    }

    async fn add_member(
        &self,
        _profile: &DomainProfile,
        group: &str,
        handle: &str,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        let members = state.groups.entry(group.to_string()).or_default();
        if members.iter().any(|m| m == handle) {
            return Err(DirectoryError::AlreadyExists(handle.to_string()));
        }
        members.push(handle.to_string());
        Ok(())
    }

    async fn remove_member(
        &self,
        _profile: &DomainProfile,
        group: &str,
        handle: &str,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        let members = state.groups.entry(group.to_string()).or_default();
        let before = members.len();
        members.retain(|m| m != handle);
        if members.len() == before {
            return Err(DirectoryError::NotFound(handle.to_string()));
        }
        Ok(())
    }

    async fn check_connection(&self, _profile: &DomainProfile) -> Result<(), DirectoryError> {
        match self.state.read().await.connection_error {
            Some(ref error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
