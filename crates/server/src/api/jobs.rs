//! Job API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use isync_core::{EnqueueRequest, Job, JobFilter};

use super::handlers::{api_error, engine_error, ApiError};
use super::middleware::AuthUser;
use crate::state::AppState;

/// Maximum allowed limit for job queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for job queries
const DEFAULT_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct CreateJobBody {
    pub source: String,
    pub destination: String,
    pub domain: String,
    /// Append `--dry-run` to every session.
    #[serde(default)]
    pub dry_run: bool,
}

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    /// Filter by state type
    pub state: Option<String>,
    pub domain: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CancelJobBody {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Enqueue a transfer job
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<CreateJobBody>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let request = EnqueueRequest::new(body.source, body.destination, body.domain)
        .with_dry_run(body.dry_run)
        .with_requested_by(user_id);

    let job = state.engine().enqueue(request).await.map_err(engine_error)?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    match state.engine().job(&id).map_err(engine_error)? {
        Some(job) => Ok(Json(job)),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Job not found: {}", id),
        )),
    }
}

/// List jobs with optional filters, newest first
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = JobFilter::new().with_limit(limit).with_offset(offset);

    if let Some(ref job_state) = params.state {
        filter = filter.with_state(job_state);
    }

    if let Some(ref domain) = params.domain {
        filter = filter.with_domain(domain);
    }

    let jobs = state.engine().jobs(&filter).map_err(engine_error)?;

    // Total without pagination
    let count_filter = JobFilter {
        limit: i64::MAX,
        offset: 0,
        ..filter.clone()
    };
    let total = state
        .engine()
        .job_count(&count_filter)
        .map_err(engine_error)?;

    Ok(Json(ListJobsResponse {
        jobs,
        total,
        limit,
        offset,
    }))
}

/// Cancel a job (DELETE endpoint). Bytes already transferred are kept.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    body: Option<Json<CancelJobBody>>,
) -> Result<Json<Job>, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);

    let job = state
        .engine()
        .cancel(&id, reason, &user_id)
        .await
        .map_err(engine_error)?;
    Ok(Json(job))
}
