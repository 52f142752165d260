use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use isync_core::identity::{IdentityError, ProvisionError};
use isync_core::{EngineError, SanitizedConfig, SchedulerError};

use crate::metrics::{collect_dynamic_metrics, encode_metrics};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Error body shared by every `/api/v1` handler.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Map an engine failure to the status the dashboard should see.
pub fn engine_error(e: EngineError) -> ApiError {
    let status = match &e {
        EngineError::Scheduler(SchedulerError::NotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Scheduler(SchedulerError::InvalidState { .. }) => StatusCode::CONFLICT,
        EngineError::Scheduler(SchedulerError::UnknownDomain(_))
        | EngineError::Scheduler(SchedulerError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
        EngineError::UnknownDomain(_) => StatusCode::NOT_FOUND,
        EngineError::Identity(IdentityError::NotFound(_))
        | EngineError::Identity(IdentityError::UnknownDomain(_)) => StatusCode::NOT_FOUND,
        EngineError::Identity(IdentityError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        EngineError::Identity(IdentityError::Directory(_)) => StatusCode::BAD_GATEWAY,
        EngineError::Provision(ProvisionError::PoolExhausted { .. }) => StatusCode::CONFLICT,
        EngineError::Provision(ProvisionError::Directory { .. }) => StatusCode::BAD_GATEWAY,
        EngineError::Scheduler(SchedulerError::Store(_))
        | EngineError::Identity(IdentityError::Store(_))
        | EngineError::Provision(ProvisionError::Store(_))
        | EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<SanitizedConfig> {
    Json(state.sanitized_config())
}

/// Prometheus scrape endpoint.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    collect_dynamic_metrics(&state);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}
