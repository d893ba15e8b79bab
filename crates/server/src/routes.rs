//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/provision", post(handlers::provision))
        .route("/status/{job_id}", get(handlers::job_status))
        .route("/cancel/{job_id}", delete(handlers::cancel_job))
        .route("/jobs", get(handlers::list_jobs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .nest("/api/v1", api_routes)
        // Probes are unauthenticated for load balancers and k8s.
        .route("/health", get(handlers::health_check))
        .route("/healthz", get(handlers::health_check))
        .route("/livez", get(handlers::health_check))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
