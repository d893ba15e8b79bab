//! The in-memory job record.
//!
//! Jobs are shared between the worker task, the HTTP handlers, and the
//! deadline watcher, so mutable state sits behind a mutex with short
//! critical sections. Terminal transitions are write-once: `fail` and
//! `complete` refuse to touch a job that already reached a terminal
//! status.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use volprov_core::{JobStatus, ProgressInfo, ProgressSink, ProgressStage, ProvisionRequest};
use volprov_jobstore::JobRecord;

#[derive(Clone)]
struct JobState {
    status: JobStatus,
    progress: Option<ProgressInfo>,
    error_message: Option<String>,
    cache_hit: Option<bool>,
    image_path: Option<PathBuf>,
    updated_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

/// One provisioning job.
pub struct Job {
    pub id: Uuid,
    pub request: ProvisionRequest,
    pub created_at: OffsetDateTime,
    state: Mutex<JobState>,
    cancel: CancellationToken,
    deadline_fired: AtomicBool,
}

impl Job {
    pub fn new(request: ProvisionRequest) -> Arc<Self> {
        let now = OffsetDateTime::now_utc();
        Arc::new(Self {
            id: Uuid::new_v4(),
            request,
            created_at: now,
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                progress: None,
                error_message: None,
                cache_hit: None,
                image_path: None,
                updated_at: now,
                completed_at: None,
            }),
            cancel: CancellationToken::new(),
            deadline_fired: AtomicBool::new(false),
        })
    }

    /// The single "job was stopped" signal, fired by user cancellation or
    /// the deadline watcher.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn mark_deadline(&self) {
        self.deadline_fired.store(true, Ordering::SeqCst);
    }

    pub fn deadline_fired(&self) -> bool {
        self.deadline_fired.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().unwrap().status
    }

    pub fn updated_at(&self) -> OffsetDateTime {
        self.state.lock().unwrap().updated_at
    }

    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Transition pending -> running. Returns false if the job is no
    /// longer pending (a cancellation won the race).
    pub fn set_running(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status != JobStatus::Pending {
            return false;
        }
        state.status = JobStatus::Running;
        state.updated_at = OffsetDateTime::now_utc();
        true
    }

    /// Terminal failure transition. Returns false if the job was already
    /// terminal, in which case the existing outcome is preserved.
    pub fn fail(&self, message: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status.is_terminal() {
            return false;
        }
        let now = OffsetDateTime::now_utc();
        state.status = JobStatus::Failed;
        state.error_message = Some(message.to_string());
        state.updated_at = now;
        state.completed_at = Some(now);
        true
    }

    /// Chain additional context (for example a failed rollback) onto an
    /// already-failed job without touching its terminal status.
    pub fn append_error(&self, extra: &str) {
        let mut state = self.state.lock().unwrap();
        state.error_message = Some(match state.error_message.take() {
            Some(existing) => format!("{existing}; {extra}"),
            None => extra.to_string(),
        });
        state.updated_at = OffsetDateTime::now_utc();
    }

    /// Terminal success transition. Returns false if the job was already
    /// terminal.
    pub fn complete(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status.is_terminal() {
            return false;
        }
        let now = OffsetDateTime::now_utc();
        state.status = JobStatus::Completed;
        state.updated_at = now;
        state.completed_at = Some(now);
        true
    }

    /// Record which cache entry backs this job.
    pub fn set_cache_result(&self, cache_hit: bool, image_path: PathBuf) {
        let mut state = self.state.lock().unwrap();
        state.cache_hit = Some(cache_hit);
        state.image_path = Some(image_path);
        state.updated_at = OffsetDateTime::now_utc();
    }

    /// Enter a pipeline stage, keeping the byte counters from the
    /// previous progress tuple.
    pub fn stage(&self, stage: ProgressStage, percent: f64) {
        let mut state = self.state.lock().unwrap();
        let (bytes_processed, bytes_total) = state
            .progress
            .as_ref()
            .map(|p| (p.bytes_processed, p.bytes_total))
            .unwrap_or((0, 0));
        state.progress = Some(ProgressInfo {
            stage,
            percent,
            bytes_processed,
            bytes_total,
        });
        state.updated_at = OffsetDateTime::now_utc();
    }

    /// Snapshot for persistence.
    pub fn record(&self) -> JobRecord {
        let state = self.state.lock().unwrap();
        JobRecord {
            id: self.id,
            status: state.status,
            request: self.request.clone(),
            progress: state.progress.clone(),
            error_message: state.error_message.clone(),
            cache_hit: state.cache_hit,
            image_path: state
                .image_path
                .as_ref()
                .map(|p| p.display().to_string()),
            created_at: self.created_at,
            updated_at: state.updated_at,
            completed_at: state.completed_at,
        }
    }

    /// Snapshot for the status API.
    pub fn view(&self) -> StatusView {
        StatusView::from_record(self.record())
    }
}

impl ProgressSink for Job {
    fn update(&self, stage: ProgressStage, percent: f64, bytes_processed: u64, bytes_total: u64) {
        let mut state = self.state.lock().unwrap();
        state.progress = Some(ProgressInfo {
            stage,
            percent,
            bytes_processed,
            bytes_total,
        });
        state.updated_at = OffsetDateTime::now_utc();
    }
}

/// Wire representation of a job for the status endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<OffsetDateTime>,
}

impl StatusView {
    /// Build the API view of a record. Cache details are part of the
    /// completion contract and are withheld for every other status.
    pub fn from_record(record: JobRecord) -> Self {
        let completed = record.status == JobStatus::Completed;
        Self {
            job_id: record.id,
            status: record.status,
            progress: record.progress,
            error: record.error_message,
            correlation_id: record
                .request
                .correlation_id
                .clone()
                .unwrap_or_else(|| record.id.to_string()),
            cache_hit: record.cache_hit.filter(|_| completed),
            image_path: record.image_path.filter(|_| completed),
            created_at: record.created_at,
            updated_at: record.updated_at,
            completed_at: record.completed_at,
        }
    }
}
