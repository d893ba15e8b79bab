//! The job manager: admission, scheduling, the provisioning pipeline,
//! rollback, and recovery.

use crate::jobs::job::{Job, StatusView};
use crate::metrics;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use volprov_blockdev::BlockDriver;
use volprov_core::checksum::{normalize_sha256_hex, token_from_url};
use volprov_core::config::JobsConfig;
use volprov_core::{JobStatus, ProgressStage, ProvisionRequest};
use volprov_imagecache::ImageCache;
use volprov_jobstore::{JobFilter, JobStore, StoreError};
use volprov_objstore::ObjectClient;

/// Error message for user-initiated cancellation.
pub const CANCELLED_MESSAGE: &str = "job cancelled by user";

/// Error message for deadline-driven cancellation.
pub const DEADLINE_MESSAGE: &str = "provisioning exceeded the configured deadline";

/// Terminal jobs retained in the in-memory table; older ones are dropped
/// by housekeeping (the durable store keeps them until retention reaps).
const MAX_TERMINAL_RETAINED: usize = 100;

/// Admission errors.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid request: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("failed to persist job: {0}")]
    Store(#[from] StoreError),
}

/// Cancellation errors.
#[derive(Debug, Error)]
pub enum CancelError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("job cannot be cancelled: {0}")]
    NotCancellable(JobStatus),
}

/// A step failure, carrying the volume to roll back when one was created
/// before the failure.
struct StepFailure {
    message: String,
    rollback_volume: Option<String>,
}

impl StepFailure {
    fn terminal(message: String) -> Self {
        Self {
            message,
            rollback_volume: None,
        }
    }
}

/// Orchestrates provisioning jobs over the cache, object store, block
/// driver, and durable store.
pub struct JobManager {
    objects: Arc<dyn ObjectClient>,
    volumes: Arc<dyn BlockDriver>,
    cache: ImageCache,
    store: Arc<dyn JobStore>,
    jobs: RwLock<HashMap<Uuid, Arc<Job>>>,
    semaphore: Arc<Semaphore>,
    job_timeout: Duration,
    max_concurrent: usize,
}

impl JobManager {
    pub fn new(
        objects: Arc<dyn ObjectClient>,
        volumes: Arc<dyn BlockDriver>,
        cache: ImageCache,
        store: Arc<dyn JobStore>,
        config: &JobsConfig,
    ) -> Self {
        Self {
            objects,
            volumes,
            cache,
            store,
            jobs: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            job_timeout: Duration::from_secs(config.timeout_minutes * 60),
            max_concurrent: config.max_concurrent,
        }
    }

    /// Override the per-job wall-clock budget.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// The configured concurrency ceiling.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Sweep jobs interrupted by a previous daemon run. Must complete
    /// before the listener starts admitting requests.
    pub async fn recover(&self) -> Result<u64, StoreError> {
        tracing::info!("Recovering jobs from previous run");
        self.store.fail_in_progress().await
    }

    /// Admit a request: validate, persist a pending record, spawn the
    /// deadline watcher and the worker.
    pub async fn submit(self: &Arc<Self>, request: ProvisionRequest) -> Result<Uuid, SubmitError> {
        request.validate().map_err(|e| match e {
            volprov_core::Error::Validation(problems) => SubmitError::Invalid(problems),
            other => SubmitError::Invalid(vec![other.to_string()]),
        })?;

        let job = Job::new(request);
        self.store.save(&job.record()).await?;
        self.jobs
            .write()
            .expect("job table lock poisoned")
            .insert(job.id, job.clone());

        // Deadline and user cancellation collapse into the job's one
        // cancellation token; the watcher only tags which source fired.
        let watcher = job.clone();
        let timeout = self.job_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    watcher.mark_deadline();
                    watcher.cancel_token().cancel();
                }
                _ = watcher.cancel_token().cancelled() => {}
            }
        });

        tokio::spawn(Arc::clone(self).run_worker(job.clone()));

        tracing::info!(
            job_id = %job.id,
            volume = %job.request.volume_name,
            url = %job.request.image_url,
            "Accepted provisioning job"
        );
        Ok(job.id)
    }

    /// Cancel a pending or running job.
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), CancelError> {
        let job = self
            .jobs
            .read()
            .expect("job table lock poisoned")
            .get(&job_id)
            .cloned()
            .ok_or(CancelError::NotFound(job_id))?;

        if !job.fail(CANCELLED_MESSAGE) {
            return Err(CancelError::NotCancellable(job.status()));
        }
        metrics::JOBS_TOTAL.with_label_values(&["failed"]).inc();
        job.cancel_token().cancel();
        self.persist(&job).await;

        tracing::info!(job_id = %job_id, "Job cancelled by user");
        Ok(())
    }

    /// Status view from the in-memory table, falling back to the durable
    /// store for jobs from earlier daemon runs.
    pub async fn get_status(&self, job_id: Uuid) -> Result<Option<StatusView>, StoreError> {
        let in_memory = self
            .jobs
            .read()
            .expect("job table lock poisoned")
            .get(&job_id)
            .cloned();
        if let Some(job) = in_memory {
            return Ok(Some(job.view()));
        }

        match self.store.get(job_id).await {
            Ok(record) => Ok(Some(StatusView::from_record(record))),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List persisted jobs, newest update first.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<StatusView>, StoreError> {
        let records = self.store.list(filter).await?;
        Ok(records.into_iter().map(StatusView::from_record).collect())
    }

    /// Reap terminal records older than the retention window.
    pub async fn delete_older_than(&self, older_than: Duration) -> Result<u64, StoreError> {
        self.store.delete_older_than(older_than).await
    }

    /// Number of pending or running jobs.
    pub fn active_jobs(&self) -> usize {
        self.jobs
            .read()
            .expect("job table lock poisoned")
            .values()
            .filter(|job| job.is_active())
            .count()
    }

    /// Drop all but the most recently updated terminal jobs from the
    /// in-memory table, bounding memory independent of request rate.
    pub fn cleanup_completed(&self) {
        let mut jobs = self.jobs.write().expect("job table lock poisoned");
        let mut terminal: Vec<(Uuid, OffsetDateTime)> = jobs
            .values()
            .filter(|job| !job.is_active())
            .map(|job| (job.id, job.updated_at()))
            .collect();
        if terminal.len() <= MAX_TERMINAL_RETAINED {
            return;
        }

        terminal.sort_by_key(|(_, updated_at)| *updated_at);
        let excess = terminal.len() - MAX_TERMINAL_RETAINED;
        for (id, _) in terminal.into_iter().take(excess) {
            jobs.remove(&id);
        }
        tracing::debug!(dropped = excess, "Dropped old terminal jobs from memory");
    }

    /// The worker task for one job.
    async fn run_worker(self: Arc<Self>, job: Arc<Job>) {
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = job.cancel_token().cancelled() => {
                self.finish_failed(&job, None).await;
                return;
            }
        };

        if !job.set_running() {
            // A cancellation won the race while the job was pending.
            self.persist(&job).await;
            drop(permit);
            return;
        }
        self.persist(&job).await;

        match self.provision(&job).await {
            Ok(()) => {
                if job.complete() {
                    metrics::JOBS_TOTAL.with_label_values(&["completed"]).inc();
                }
                self.persist(&job).await;
                tracing::info!(
                    job_id = %job.id,
                    volume = %job.request.volume_name,
                    "Provisioning completed"
                );
            }
            Err(failure) => {
                self.finish_failed(&job, Some(failure.message)).await;
                if let Some(volume) = failure.rollback_volume {
                    self.rollback_volume(&job, &volume).await;
                }
            }
        }

        // Terminal: release the permit and silence the deadline watcher.
        drop(permit);
        job.cancel_token().cancel();
    }

    /// The pipeline proper. Every step checkpoints cancellation first and
    /// persists its stage transition before doing work.
    async fn provision(&self, job: &Arc<Job>) -> Result<(), StepFailure> {
        let req = job.request.clone();
        let cancel = job.cancel_token().clone();

        job.stage(ProgressStage::Initializing, 0.0);
        self.persist(job).await;
        self.checkpoint(job, None)?;

        // Resolve the checksum from the sidecar object; fall back to
        // URL-keyed caching when the sidecar is missing or malformed.
        let sidecar_url = format!("{}.sha256", req.image_url);
        let (cache_key, content_addressed) =
            match self.objects.get_small(&sidecar_url, &cancel).await {
                Ok(bytes) => match std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| normalize_sha256_hex(s).ok())
                {
                    Some(checksum) => (checksum, true),
                    None => {
                        tracing::warn!(
                            job_id = %job.id,
                            sidecar = %sidecar_url,
                            "Sidecar checksum malformed, using URL as cache key"
                        );
                        (req.image_url.clone(), false)
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        sidecar = %sidecar_url,
                        error = %e,
                        "Failed to fetch image checksum, using URL as cache key"
                    );
                    (req.image_url.clone(), false)
                }
            };

        self.checkpoint(job, None)?;
        job.stage(ProgressStage::CheckingCache, 5.0);
        self.persist(job).await;

        let cached = match self.cache.lookup(&cache_key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    error = %e,
                    "Cache lookup failed, proceeding with download"
                );
                None
            }
        };

        let image_path = match cached {
            Some(entry) => {
                tracing::info!(
                    job_id = %job.id,
                    image_path = %entry.path.display(),
                    checksum = %entry.checksum,
                    cache_hit = true,
                    "Using cached image"
                );
                job.set_cache_result(true, entry.path.clone());
                entry.path
            }
            None => {
                self.download_image(job, &req, &cache_key, content_addressed, &cancel)
                    .await?
            }
        };

        self.checkpoint(job, None)?;
        job.stage(ProgressStage::CreatingVolume, 50.0);
        self.persist(job).await;

        self.volumes
            .create(&req.volume_name, req.volume_size_gb)
            .await
            .map_err(|e| StepFailure::terminal(self.step_context(job, "create volume", &e)))?;

        // A volume exists from here on: any failure, including an observed
        // cancellation, must delete it again.
        self.checkpoint(job, Some(&req.volume_name))?;
        job.stage(ProgressStage::Converting, 75.0);
        self.persist(job).await;

        if let Err(e) = self
            .volumes
            .populate(
                &image_path,
                &req.volume_name,
                req.image_type,
                job.as_ref(),
                &cancel,
            )
            .await
        {
            return Err(StepFailure {
                message: self.step_context(job, "populate volume", &e),
                rollback_volume: Some(req.volume_name.clone()),
            });
        }

        self.checkpoint(job, Some(&req.volume_name))?;
        job.stage(ProgressStage::Finalizing, 100.0);
        self.persist(job).await;
        Ok(())
    }

    /// Cache miss path: allocate the cache slot, stream the image down,
    /// and commit the entry. Commit failures are warnings, never job
    /// failures: the image on disk is still good for this provisioning.
    async fn download_image(
        &self,
        job: &Arc<Job>,
        req: &ProvisionRequest,
        cache_key: &str,
        content_addressed: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, StepFailure> {
        tracing::info!(
            job_id = %job.id,
            url = %req.image_url,
            cache_hit = false,
            "Image not cached, downloading"
        );

        let token = token_from_url(&req.image_url);
        let image_path = self
            .cache
            .allocate_path(&token)
            .await
            .map_err(|e| StepFailure::terminal(self.step_context(job, "allocate cache path", &e)))?;

        job.stage(ProgressStage::Downloading, 10.0);
        self.persist(job).await;

        if let Err(e) = self
            .objects
            .stream_to(&req.image_url, &image_path, job.as_ref(), cancel)
            .await
        {
            // Orphan cleanup: never leave a torn download at a committed path.
            if let Err(cleanup) = self.cache.remove(&image_path).await {
                tracing::warn!(
                    job_id = %job.id,
                    image_path = %image_path.display(),
                    error = %cleanup,
                    "Failed to clean up partial download"
                );
            }
            return Err(StepFailure::terminal(
                self.step_context(job, "download image", &e),
            ));
        }

        let checksum = if content_addressed {
            Some(cache_key.to_string())
        } else {
            match self.cache.compute_checksum(&image_path).await {
                Ok(checksum) => Some(checksum),
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        error = %e,
                        "Failed to compute local checksum, skipping cache commit"
                    );
                    None
                }
            }
        };

        if let Some(checksum) = checksum {
            match self.cache.commit(&image_path, &checksum).await {
                Ok(()) => {
                    tracing::info!(
                        job_id = %job.id,
                        image_path = %image_path.display(),
                        checksum = %checksum,
                        "Image downloaded and cached"
                    );
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to commit cache entry");
                }
            }
        }

        job.set_cache_result(false, image_path.clone());
        Ok(image_path)
    }

    /// Cancellation checkpoint between steps. Carries the volume needing
    /// rollback once one has been created.
    fn checkpoint(&self, job: &Arc<Job>, rollback_volume: Option<&str>) -> Result<(), StepFailure> {
        if job.cancel_token().is_cancelled() {
            return Err(StepFailure {
                message: self.step_context(job, "pipeline", &"job stopped"),
                rollback_volume: rollback_volume.map(str::to_string),
            });
        }
        Ok(())
    }

    /// Mark the job failed and persist. The deadline message wins over
    /// step errors when the watcher fired; a job already failed by
    /// `cancel` keeps its user-cancel message.
    async fn finish_failed(&self, job: &Arc<Job>, step_message: Option<String>) {
        let message = if job.deadline_fired() {
            DEADLINE_MESSAGE.to_string()
        } else {
            step_message.unwrap_or_else(|| CANCELLED_MESSAGE.to_string())
        };
        if job.fail(&message) {
            metrics::JOBS_TOTAL.with_label_values(&["failed"]).inc();
            tracing::warn!(
                job_id = %job.id,
                volume = %job.request.volume_name,
                error = %message,
                "Provisioning failed"
            );
        }
        self.persist(job).await;
    }

    /// Delete the volume a failed job created. A rollback failure chains
    /// onto the job's error message.
    async fn rollback_volume(&self, job: &Arc<Job>, volume: &str) {
        tracing::warn!(job_id = %job.id, volume, "Rolling back: deleting failed volume");
        if let Err(e) = self.volumes.delete(volume).await {
            tracing::error!(
                job_id = %job.id,
                volume,
                error = %e,
                "Rollback failed: could not delete volume"
            );
            job.append_error(&format!("rollback failed: {e}"));
            self.persist(job).await;
        }
    }

    /// Push the current record to the store; a failed save is retried
    /// once, then logged. The startup sweep is the backstop for records
    /// left behind.
    async fn persist(&self, job: &Job) {
        let record = job.record();
        if let Err(first) = self.store.save(&record).await {
            tracing::warn!(job_id = %job.id, error = %first, "Failed to persist job state, retrying");
            if let Err(second) = self.store.save(&record).await {
                tracing::error!(
                    job_id = %job.id,
                    error = %second,
                    "Failed to persist job state; leaving last durable state"
                );
            }
        }
    }

    fn step_context(&self, job: &Job, step: &str, err: &dyn std::fmt::Display) -> String {
        format!(
            "{step} failed for job {} (volume {}): {err}",
            job.id, job.request.volume_name
        )
    }
}
