//! Identity pool and per-domain override handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use isync_core::identity::DomainHealth;
use isync_core::{DomainPool, Identity};

use super::handlers::{engine_error, ApiError};
use super::middleware::AuthUser;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct IdentityPoolsResponse {
    pub domains: Vec<DomainPool>,
}

#[derive(Debug, Serialize)]
pub struct RetireResponse {
    pub handle: String,
    /// "retired", "already_retired" or "deferred"
    pub outcome: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DomainHealthResponse {
    pub domains: Vec<DomainHealth>,
}

/// Live identities of every configured domain
pub async fn list_identities(
    State(state): State<Arc<AppState>>,
) -> Result<Json<IdentityPoolsResponse>, ApiError> {
    let domains = state.engine().identity_pools().map_err(engine_error)?;
    Ok(Json(IdentityPoolsResponse { domains }))
}

/// Retire an identity now. Deferred while a session holds it.
pub async fn retire_identity(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(handle): Path<String>,
) -> Result<Json<RetireResponse>, ApiError> {
    let outcome = state
        .engine()
        .retire_now(&handle, &user_id)
        .await
        .map_err(engine_error)?;

    if let Some((_, domain)) = handle.split_once('@') {
        state.ws_broadcaster().identities_changed(domain);
    }

    Ok(Json(RetireResponse {
        handle,
        outcome: outcome.as_str(),
    }))
}

/// Provision an extra identity for a domain
pub async fn provision_identity(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(domain): Path<String>,
) -> Result<(StatusCode, Json<Identity>), ApiError> {
    let identity = state
        .engine()
        .provision_now(&domain, &user_id)
        .await
        .map_err(engine_error)?;

    state.ws_broadcaster().identities_changed(&domain);
    Ok((StatusCode::CREATED, Json(identity)))
}

/// Credentials and directory connectivity for one domain
pub async fn domain_health(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> Result<Json<DomainHealth>, ApiError> {
    let health = state
        .engine()
        .check_domain(&domain)
        .await
        .map_err(engine_error)?;
    Ok(Json(health))
}

/// Connectivity for every domain, checked concurrently
pub async fn all_domains_health(
    State(state): State<Arc<AppState>>,
) -> Json<DomainHealthResponse> {
    Json(DomainHealthResponse {
        domains: state.engine().check_all_domains().await,
    })
}
