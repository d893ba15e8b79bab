//! Health probes.

use crate::metrics;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub version: String,
    pub active_jobs: usize,
}

/// GET /health, /healthz, /livez
///
/// Reports "degraded" once active jobs exceed the concurrency ceiling:
/// the daemon still works, but new jobs are queueing.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let active_jobs = state.manager.active_jobs();
    metrics::ACTIVE_JOBS.set(active_jobs as i64);

    let status = if active_jobs > state.manager.max_concurrent() {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        timestamp: OffsetDateTime::now_utc(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_jobs,
    })
}
