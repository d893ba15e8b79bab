//! Common test utilities: mock collaborators and a wired-up harness.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use volprov_blockdev::{BlockDriver, BlockError, BlockResult, VolumeInfo};
use volprov_core::checksum::sha256_hex;
use volprov_core::config::JobsConfig;
use volprov_core::{AppConfig, ImageFormat, ProgressSink, ProgressStage, ProvisionRequest};
use volprov_imagecache::ImageCache;
use volprov_jobstore::{JobStore, SqliteStore};
use volprov_objstore::{ObjectClient, ObjectError, ObjectResult};
use volprov_server::auth::TokenValidator;
use volprov_server::jobs::StatusView;
use volprov_server::{AppState, JobManager};

const STREAM_CHUNK: usize = 64 * 1024;

/// In-memory object store with hooks for failure, delay, and hold-points.
pub struct MockObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
    pub bytes_streamed: AtomicU64,
    pub stream_calls: AtomicU32,
    fail_streams: AtomicBool,
    hold_streams: AtomicBool,
    /// One permit per stream that reached its hold point.
    pub stream_started: Semaphore,
    /// Add permits to let held streams continue.
    pub stream_release: Semaphore,
}

impl MockObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            bytes_streamed: AtomicU64::new(0),
            stream_calls: AtomicU32::new(0),
            fail_streams: AtomicBool::new(false),
            hold_streams: AtomicBool::new(false),
            stream_started: Semaphore::new(0),
            stream_release: Semaphore::new(0),
        })
    }

    pub fn put_object(&self, url: &str, data: impl Into<Bytes>) {
        self.objects.lock().unwrap().insert(url.to_string(), data.into());
    }

    /// Store an object together with its checksum sidecar.
    pub fn put_with_sidecar(&self, url: &str, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let checksum = sha256_hex(&data);
        self.put_object(url, data);
        self.put_object(&format!("{url}.sha256"), Bytes::from(checksum.clone()));
        checksum
    }

    pub fn fail_streams(&self, fail: bool) {
        self.fail_streams.store(fail, Ordering::SeqCst);
    }

    /// Make streams pause after their first chunk until released.
    pub fn hold_streams(&self, hold: bool) {
        self.hold_streams.store(hold, Ordering::SeqCst);
    }

    fn get(&self, url: &str) -> ObjectResult<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| ObjectError::NotFound(url.to_string()))
    }
}

#[async_trait]
impl ObjectClient for MockObjectStore {
    async fn stat(&self, url: &str, _cancel: &CancellationToken) -> ObjectResult<u64> {
        Ok(self.get(url)?.len() as u64)
    }

    async fn get_small(&self, url: &str, _cancel: &CancellationToken) -> ObjectResult<Bytes> {
        self.get(url)
    }

    async fn stream_to(
        &self,
        url: &str,
        dest: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> ObjectResult<u64> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.get(url)?;
        if self.fail_streams.load(Ordering::SeqCst) {
            return Err(ObjectError::Transport(format!("{url}: injected failure")));
        }

        let total = data.len() as u64;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut held = false;

        for chunk in data.chunks(STREAM_CHUNK) {
            if cancel.is_cancelled() {
                return Err(ObjectError::Cancelled);
            }
            file.write_all(chunk).await?;
            written += chunk.len() as u64;
            self.bytes_streamed.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            sink.update(
                ProgressStage::Downloading,
                10.0 + (written as f64 / total as f64) * 30.0,
                written,
                total,
            );

            if !held && self.hold_streams.load(Ordering::SeqCst) {
                held = true;
                self.stream_started.add_permits(1);
                tokio::select! {
                    permit = self.stream_release.acquire() => permit.unwrap().forget(),
                    _ = cancel.cancelled() => return Err(ObjectError::Cancelled),
                }
            }
        }

        file.sync_all().await?;
        Ok(written)
    }
}

/// In-memory block driver with failure injection and hold-points.
pub struct MockBlockDriver {
    volumes: Mutex<HashMap<String, u64>>,
    pub populated: Mutex<Vec<(String, PathBuf, ImageFormat)>>,
    fail_populate: AtomicBool,
    fail_delete: AtomicBool,
    hold_populate: AtomicBool,
    pub populate_started: Semaphore,
    pub populate_release: Semaphore,
}

impl MockBlockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            volumes: Mutex::new(HashMap::new()),
            populated: Mutex::new(Vec::new()),
            fail_populate: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            hold_populate: AtomicBool::new(false),
            populate_started: Semaphore::new(0),
            populate_release: Semaphore::new(0),
        })
    }

    pub fn fail_populate(&self, fail: bool) {
        self.fail_populate.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn hold_populate(&self, hold: bool) {
        self.hold_populate.store(hold, Ordering::SeqCst);
    }

    pub fn volume_size(&self, name: &str) -> Option<u64> {
        self.volumes.lock().unwrap().get(name).copied()
    }
}

#[async_trait]
impl BlockDriver for MockBlockDriver {
    async fn create(&self, name: &str, size_gib: u64) -> BlockResult<()> {
        let mut volumes = self.volumes.lock().unwrap();
        if volumes.contains_key(name) {
            return Err(BlockError::AlreadyExists(format!("data/{name}")));
        }
        volumes.insert(name.to_string(), size_gib);
        Ok(())
    }

    async fn populate(
        &self,
        image_path: &Path,
        name: &str,
        format: ImageFormat,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> BlockResult<()> {
        if self.hold_populate.load(Ordering::SeqCst) {
            self.populate_started.add_permits(1);
            tokio::select! {
                permit = self.populate_release.acquire() => permit.unwrap().forget(),
                _ = cancel.cancelled() => return Err(BlockError::Cancelled),
            }
        }
        if cancel.is_cancelled() {
            return Err(BlockError::Cancelled);
        }
        if self.fail_populate.load(Ordering::SeqCst) {
            return Err(BlockError::CommandFailed {
                tool: "qemu-img".to_string(),
                status: "exit status: 1".to_string(),
                output: "injected conversion failure".to_string(),
            });
        }
        if !self.volumes.lock().unwrap().contains_key(name) {
            return Err(BlockError::NotFound(format!("data/{name}")));
        }

        self.populated
            .lock()
            .unwrap()
            .push((name.to_string(), image_path.to_path_buf(), format));
        sink.update(ProgressStage::Converting, 90.0, 0, 0);
        Ok(())
    }

    async fn delete(&self, name: &str) -> BlockResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(BlockError::CommandFailed {
                tool: "lvremove".to_string(),
                status: "exit status: 5".to_string(),
                output: "injected delete failure".to_string(),
            });
        }
        self.volumes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> BlockResult<bool> {
        Ok(self.volumes.lock().unwrap().contains_key(name))
    }

    async fn info(&self, name: &str) -> BlockResult<VolumeInfo> {
        let volumes = self.volumes.lock().unwrap();
        let size_gib = volumes
            .get(name)
            .ok_or_else(|| BlockError::NotFound(format!("data/{name}")))?;
        Ok(VolumeInfo {
            name: name.to_string(),
            size_bytes: size_gib * 1024 * 1024 * 1024,
            attributes: "-wi-a-----".to_string(),
        })
    }

    async fn list(&self) -> BlockResult<Vec<String>> {
        Ok(self.volumes.lock().unwrap().keys().cloned().collect())
    }
}

/// A fully wired manager over temp storage and mock collaborators.
pub struct TestHarness {
    pub temp: TempDir,
    pub objects: Arc<MockObjectStore>,
    pub volumes: Arc<MockBlockDriver>,
    pub store: Arc<dyn JobStore>,
    pub manager: Arc<JobManager>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_options(2, Duration::from_secs(60)).await
    }

    pub async fn with_options(max_concurrent: usize, job_timeout: Duration) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let objects = MockObjectStore::new();
        let volumes = MockBlockDriver::new();
        let store: Arc<dyn JobStore> = Arc::new(
            SqliteStore::new(temp.path().join("jobs.db")).await.unwrap(),
        );
        let cache = ImageCache::new(temp.path().join("images"));

        let jobs_config = JobsConfig {
            max_concurrent,
            timeout_minutes: 30,
            retention_days: 7,
        };
        let manager = Arc::new(
            JobManager::new(
                objects.clone(),
                volumes.clone(),
                cache,
                store.clone(),
                &jobs_config,
            )
            .with_job_timeout(job_timeout),
        );

        Self {
            temp,
            objects,
            volumes,
            store,
            manager,
        }
    }

    pub fn cache_root(&self) -> PathBuf {
        self.temp.path().join("images")
    }

    pub fn state(&self, tokens: Option<TokenValidator>) -> AppState {
        volprov_server::metrics::register_metrics();
        AppState::new(AppConfig::default(), self.manager.clone(), tokens)
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_terminal(&self, job_id: Uuid) -> StatusView {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let view = self
                .manager
                .get_status(job_id)
                .await
                .unwrap()
                .expect("job should exist");
            if view.status.is_terminal() {
                return view;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job {job_id} did not reach a terminal status in time");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A well-formed request for `url` targeting `volume`.
pub fn request(url: &str, volume: &str) -> ProvisionRequest {
    ProvisionRequest {
        image_url: url.to_string(),
        volume_name: volume.to_string(),
        volume_size_gb: 10,
        image_type: ImageFormat::Compressed,
        correlation_id: None,
    }
}
