use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use isync_core::audit::{AuditError, AuditFilter, AuditRecord, DEFAULT_AUDIT_PAGE};

use super::handlers::{api_error, ApiError};
use crate::state::AppState;

const MAX_LIMIT: i64 = 1000;
const DEFAULT_LIMIT: i64 = DEFAULT_AUDIT_PAGE;

/// `GET /api/v1/audit` query string.
#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    pub job_id: Option<String>,
    /// Exact identity handle
    pub identity: Option<String>,
    /// All identities of one domain
    pub domain: Option<String>,
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    /// RFC 3339, inclusive
    pub from: Option<DateTime<Utc>>,
    /// RFC 3339, inclusive
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditQueryParams {
    /// Filter without paging, used for the total count.
    fn to_filter(&self) -> AuditFilter {
        let mut filter = AuditFilter::new().with_time_range(self.from, self.to);
        if let Some(job_id) = &self.job_id {
            filter = filter.with_job_id(job_id);
        }
        if let Some(identity) = &self.identity {
            filter = filter.with_identity(identity);
        }
        if let Some(domain) = &self.domain {
            filter = filter.with_domain(domain);
        }
        if let Some(event_type) = &self.event_type {
            filter = filter.with_event_type(event_type);
        }
        if let Some(user_id) = &self.user_id {
            filter = filter.with_user_id(user_id);
        }
        filter
    }
}

#[derive(Debug, Serialize)]
pub struct AuditQueryResponse {
    pub events: Vec<AuditRecord>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

fn store_error(e: AuditError) -> ApiError {
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Audit store error: {}", e),
    )
}

/// Page through audit history, newest first.
pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQueryParams>,
) -> Result<Json<AuditQueryResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let filter = params.to_filter();
    let total = state.audit_store().count(&filter).map_err(store_error)?;
    let events = state
        .audit_store()
        .query(&filter.with_limit(limit).with_offset(offset))
        .map_err(store_error)?;

    Ok(Json(AuditQueryResponse {
        events,
        total,
        limit,
        offset,
    }))
}
