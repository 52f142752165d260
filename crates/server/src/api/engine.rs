//! Engine status and scheduler toggle handlers.

use axum::{extract::State, Json};
use std::sync::Arc;

use isync_core::EngineStatus;

use super::handlers::{engine_error, ApiError};
use super::middleware::AuthUser;
use crate::state::AppState;

pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EngineStatus>, ApiError> {
    let status = state.engine().status().map_err(engine_error)?;
    Ok(Json(status))
}

/// Start the scheduler loop. Starting a running scheduler is a no-op.
pub async fn start(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<EngineStatus>, ApiError> {
    state.engine().start(&user_id).await;
    state.ws_broadcaster().scheduler_status(true);
    get_status(State(state)).await
}

/// Stop claiming jobs and interrupt in-flight sessions; interrupted jobs
/// resume on the next start.
pub async fn stop(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<EngineStatus>, ApiError> {
    state.engine().stop(&user_id).await;
    state.ws_broadcaster().scheduler_status(false);
    get_status(State(state)).await
}
