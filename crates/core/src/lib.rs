//! Shared domain types and utilities for the volprov daemon.
//!
//! This crate provides the vocabulary the other crates speak:
//! - Provisioning requests, job statuses, and progress stages
//! - Daemon configuration assembled from environment variables
//! - The bounded retry policy used by the network and block-storage layers
//! - The progress-sink capability ticked by long-running operations
//! - Checksum and cache-token helpers

pub mod checksum;
pub mod config;
pub mod error;
pub mod progress;
pub mod retry;
pub mod types;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use progress::ProgressSink;
pub use retry::{RetryError, RetryPolicy};
pub use types::{ImageFormat, JobStatus, ProgressInfo, ProgressStage, ProvisionRequest};
