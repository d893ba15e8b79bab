//! Durable job persistence for the volprov daemon.
//!
//! One SQLite file holds every job the daemon has accepted, so terminal
//! job history survives restarts and interrupted jobs can be swept to
//! `failed` before new work is admitted.

pub mod error;
pub mod models;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use models::{JobFilter, JobRecord};
pub use store::{JobStore, SqliteStore, RECOVERY_ERROR_MESSAGE};
