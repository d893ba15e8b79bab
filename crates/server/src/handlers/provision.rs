//! Provisioning, status, and cancellation handlers.

use crate::error::{ApiError, ApiResult};
use crate::jobs::manager::{CancelError, SubmitError};
use crate::jobs::StatusView;
use crate::metrics;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use volprov_core::{JobStatus, ProvisionRequest};
use volprov_jobstore::JobFilter;

/// Response to an accepted provisioning request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub job_id: Uuid,
}

/// Response to a cancellation request.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: String,
    pub job_id: Uuid,
}

/// Query parameters for the job list endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

/// POST /api/v1/provision
pub async fn provision(
    State(state): State<AppState>,
    Json(request): Json<ProvisionRequest>,
) -> ApiResult<(StatusCode, Json<ProvisionResponse>)> {
    match state.manager.submit(request).await {
        Ok(job_id) => {
            metrics::JOBS_TOTAL.with_label_values(&["started"]).inc();
            Ok((StatusCode::ACCEPTED, Json(ProvisionResponse { job_id })))
        }
        Err(SubmitError::Invalid(problems)) => Err(ApiError::Validation(problems)),
        Err(SubmitError::Store(e)) => {
            metrics::JOBS_TOTAL.with_label_values(&["failed"]).inc();
            Err(ApiError::Internal(format!("failed to start provisioning: {e}")))
        }
    }
}

/// GET /api/v1/status/{job_id}
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<StatusView>> {
    let job_id = parse_job_id(&job_id)?;
    let view = state
        .manager
        .get_status(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {job_id}")))?;
    Ok(Json(view))
}

/// DELETE /api/v1/cancel/{job_id}
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let job_id = parse_job_id(&job_id)?;
    match state.manager.cancel(job_id).await {
        Ok(()) => Ok(Json(CancelResponse {
            status: "cancelled".to_string(),
            job_id,
        })),
        Err(CancelError::NotFound(id)) => Err(ApiError::NotFound(format!("job not found: {id}"))),
        Err(e @ CancelError::NotCancellable(_)) => Err(ApiError::BadRequest(e.to_string())),
    }
}

/// GET /api/v1/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<StatusView>>> {
    let views = state
        .manager
        .list(JobFilter {
            status: query.status,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;
    Ok(Json(views))
}

fn parse_job_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid job id '{raw}'")))
}
