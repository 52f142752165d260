use async_trait::async_trait;
use thiserror::Error;

use super::types::{AuthRequest, Principal};

#[derive(Debug, Error)]
pub enum AuthError {
    /// No credentials were presented.
    #[error("Authentication required")]
    NotAuthenticated,

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Decides who is calling `/api/v1`. `/metrics` is never gated.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<Principal, AuthError>;

    /// Value of `auth.method` this authenticator implements.
    fn method_name(&self) -> &'static str;
}
