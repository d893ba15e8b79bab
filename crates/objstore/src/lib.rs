//! Object-store access for the volprov daemon.
//!
//! The daemon needs three capabilities from the store holding base
//! images: stat an object, fetch a small sidecar blob, and stream a large
//! object to a local path with progress. [`ObjectClient`] captures that
//! contract; [`S3ObjectClient`] implements it against any S3-compatible
//! endpoint (MinIO in the reference deployment).

pub mod client;
pub mod error;
pub mod s3;

pub use client::ObjectClient;
pub use error::{ObjectError, ObjectResult};
pub use s3::S3ObjectClient;
