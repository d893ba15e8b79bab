//! Job record model and its database row form.
//!
//! `JobRecord` is the typed domain view (enums, timestamps, parsed
//! request); `JobRow` is the raw table shape. Conversion happens at the
//! store boundary, and unknown on-disk statuses are rejected rather than
//! silently carried.

use crate::error::{StoreError, StoreResult};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;
use volprov_core::{JobStatus, ProgressInfo, ProvisionRequest};

/// A job as the rest of the daemon sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: JobStatus,
    pub request: ProvisionRequest,
    pub progress: Option<ProgressInfo>,
    pub error_message: Option<String>,
    pub cache_hit: Option<bool>,
    pub image_path: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl JobRecord {
    /// A fresh pending record for a just-admitted request.
    pub fn pending(id: Uuid, request: ProvisionRequest, now: OffsetDateTime) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            request,
            progress: None,
            error_message: None,
            cache_hit: None,
            image_path: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Filtering options for [`crate::JobStore::list`].
#[derive(Clone, Copy, Debug, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Zero means the default page size (100). Capped at 10 000.
    pub limit: u32,
    pub offset: u32,
}

/// Raw row shape of the `jobs` table.
#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub status: String,
    pub request_json: String,
    pub progress_json: Option<String>,
    pub error_message: Option<String>,
    pub cache_hit: Option<bool>,
    pub image_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

fn timestamp(id: &str, field: &str, unix: i64) -> StoreResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(unix).map_err(|e| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("bad {field} timestamp {unix}: {e}"),
    })
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> StoreResult<Self> {
        let id = Uuid::parse_str(&row.id).map_err(|e| StoreError::Corrupt {
            id: row.id.clone(),
            reason: format!("bad job id: {e}"),
        })?;
        let status: JobStatus = row.status.parse().map_err(|_| StoreError::Corrupt {
            id: row.id.clone(),
            reason: format!("unknown status '{}'", row.status),
        })?;
        let request: ProvisionRequest =
            serde_json::from_str(&row.request_json).map_err(|e| StoreError::Corrupt {
                id: row.id.clone(),
                reason: format!("bad request payload: {e}"),
            })?;
        let progress = row
            .progress_json
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                id: row.id.clone(),
                reason: format!("bad progress payload: {e}"),
            })?;

        Ok(JobRecord {
            created_at: timestamp(&row.id, "created_at", row.created_at)?,
            updated_at: timestamp(&row.id, "updated_at", row.updated_at)?,
            completed_at: row
                .completed_at
                .map(|t| timestamp(&row.id, "completed_at", t))
                .transpose()?,
            id,
            status,
            request,
            progress,
            error_message: row.error_message.filter(|s| !s.is_empty()),
            cache_hit: row.cache_hit,
            image_path: row.image_path.filter(|s| !s.is_empty()),
        })
    }
}
