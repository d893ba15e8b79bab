//! Prometheus metrics for the volprov daemon.
//!
//! The registry and the concurrency semaphore are the only process-wide
//! singletons; everything else is constructed at startup and plumbed
//! explicitly.

use axum::extract::{MatchedPath, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Requests by method, route template, and response status.
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "volprov_requests_total",
            "Total number of HTTP requests by endpoint and method",
        ),
        &["method", "endpoint", "status"],
    )
    .expect("metric creation failed")
});

/// Jobs by lifecycle event: started, completed, failed.
pub static JOBS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("volprov_jobs_total", "Total number of jobs by status"),
        &["status"],
    )
    .expect("metric creation failed")
});

/// Currently pending or running jobs.
pub static ACTIVE_JOBS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("volprov_active_jobs", "Number of currently active jobs")
        .expect("metric creation failed")
});

/// Register all metrics with the global registry. Idempotent.
pub fn register_metrics() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        REGISTRY
            .register(Box::new(REQUESTS_TOTAL.clone()))
            .expect("failed to register requests metric");
        REGISTRY
            .register(Box::new(JOBS_TOTAL.clone()))
            .expect("failed to register jobs metric");
        REGISTRY
            .register(Box::new(ACTIVE_JOBS.clone()))
            .expect("failed to register active jobs metric");
    });
}

/// Middleware counting every request against its route template.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;

    REQUESTS_TOTAL
        .with_label_values(&[&method, &endpoint, response.status().as_str()])
        .inc();
    response
}

/// Serve the registry in Prometheus text format.
pub async fn metrics_handler() -> Response {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "encoding failure").into_response();
    }

    (
        [("content-type", encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
