//! HTTP control plane and provisioning engine.
//!
//! This crate hosts:
//! - The job manager: admission, bounded concurrency, the provisioning
//!   pipeline, rollback, cancellation, and crash recovery
//! - The HTTP API (provision / status / cancel / jobs / health)
//! - Bearer-token auth middleware and Prometheus metrics

pub mod auth;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use jobs::manager::JobManager;
pub use routes::create_router;
pub use state::AppState;
