//! S3-compatible object client using the AWS SDK.

use crate::client::{parse_object_url, ObjectClient};
use crate::error::{ObjectError, ObjectResult};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::future::Future;
use std::path::Path;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use volprov_core::config::ObjectStoreConfig;
use volprov_core::{ProgressSink, ProgressStage, RetryPolicy};

/// Write/tick granularity for streamed downloads.
const DOWNLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Upper bound for [`ObjectClient::get_small`] reads. Checksum sidecars
/// are under a hundred bytes; anything beyond this is not a sidecar.
const MAX_SMALL_OBJECT: u64 = 64 * 1024;

/// Share of the job progress bar the download occupies (10% to 40%).
const DOWNLOAD_PROGRESS_BASE: f64 = 10.0;
const DOWNLOAD_PROGRESS_SPAN: f64 = 30.0;

/// Object client for any S3-compatible endpoint.
pub struct S3ObjectClient {
    client: Client,
    retry: RetryPolicy,
}

impl S3ObjectClient {
    /// Build a client from the daemon configuration: custom endpoint,
    /// path-style addressing, static credentials.
    pub fn new(config: &ObjectStoreConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "volprov-static",
        );
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            retry: config.retry_policy(),
        }
    }

    /// Run one operation under the network retry policy. Non-transient
    /// errors (not-found, auth, bad URLs) short-circuit without retrying.
    async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> ObjectResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ObjectResult<T>>,
    {
        let outcome = self
            .retry
            .run(cancel, || {
                let fut = op();
                async move {
                    match fut.await {
                        Ok(value) => Ok(Ok(value)),
                        Err(e) if e.is_transient() => Err(e),
                        Err(e) => Ok(Err(e)),
                    }
                }
            })
            .await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(fatal)) => Err(fatal),
            Err(retry_err) => Err(ObjectError::from_retry(retry_err)),
        }
    }

    async fn stat_once(&self, url: &str) -> ObjectResult<u64> {
        let (bucket, object) = parse_object_url(url)?;
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(object)
            .send()
            .await
            .map_err(|err| {
                if matches!(&err, SdkError::ServiceError(se) if se.err().is_not_found()) {
                    ObjectError::NotFound(url.to_string())
                } else {
                    classify(url, err)
                }
            })?;

        match head.content_length() {
            Some(len) if len >= 0 => Ok(len as u64),
            _ => Err(ObjectError::Transport(format!(
                "{url}: object store reported no content length"
            ))),
        }
    }

    async fn get_small_once(&self, url: &str) -> ObjectResult<Bytes> {
        let (bucket, object) = parse_object_url(url)?;
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(object)
            .send()
            .await
            .map_err(|err| {
                if matches!(&err, SdkError::ServiceError(se) if se.err().is_no_such_key()) {
                    ObjectError::NotFound(url.to_string())
                } else {
                    classify(url, err)
                }
            })?;

        if let Some(len) = resp.content_length() {
            if len > MAX_SMALL_OBJECT as i64 {
                return Err(ObjectError::TooLarge {
                    size: len as u64,
                    max: MAX_SMALL_OBJECT,
                });
            }
        }

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| ObjectError::Transport(format!("{url}: {e}")))?
            .into_bytes();

        if data.len() as u64 > MAX_SMALL_OBJECT {
            return Err(ObjectError::TooLarge {
                size: data.len() as u64,
                max: MAX_SMALL_OBJECT,
            });
        }
        Ok(data)
    }

    async fn stream_to_once(
        &self,
        url: &str,
        dest: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> ObjectResult<u64> {
        let total = self.stat_once(url).await?;

        let (bucket, object) = parse_object_url(url)?;
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(object)
            .send()
            .await
            .map_err(|err| {
                if matches!(&err, SdkError::ServiceError(se) if se.err().is_no_such_key()) {
                    ObjectError::NotFound(url.to_string())
                } else {
                    classify(url, err)
                }
            })?;

        let mut open = tokio::fs::OpenOptions::new();
        open.write(true).create(true).truncate(true);
        #[cfg(unix)]
        open.mode(0o600);
        let file = open.open(dest).await?;
        let mut writer = BufWriter::with_capacity(DOWNLOAD_CHUNK_SIZE, file);

        let mut body = resp.body;
        let mut written: u64 = 0;
        let mut since_tick: usize = 0;

        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| ObjectError::Transport(format!("{url}: {e}")))?
        {
            if cancel.is_cancelled() {
                return Err(ObjectError::Cancelled);
            }
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            since_tick += chunk.len();

            if since_tick >= DOWNLOAD_CHUNK_SIZE {
                since_tick = 0;
                sink.update(
                    ProgressStage::Downloading,
                    download_percent(written, total),
                    written,
                    total,
                );
            }
        }

        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;

        if written != total {
            return Err(ObjectError::SizeMismatch {
                expected: total,
                actual: written,
            });
        }

        sink.update(
            ProgressStage::Downloading,
            DOWNLOAD_PROGRESS_BASE + DOWNLOAD_PROGRESS_SPAN,
            written,
            total,
        );
        Ok(written)
    }
}

#[async_trait]
impl ObjectClient for S3ObjectClient {
    async fn stat(&self, url: &str, cancel: &CancellationToken) -> ObjectResult<u64> {
        self.with_retry(cancel, || self.stat_once(url)).await
    }

    async fn get_small(&self, url: &str, cancel: &CancellationToken) -> ObjectResult<Bytes> {
        self.with_retry(cancel, || self.get_small_once(url)).await
    }

    async fn stream_to(
        &self,
        url: &str,
        dest: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> ObjectResult<u64> {
        let result = self
            .with_retry(cancel, || self.stream_to_once(url, dest, sink, cancel))
            .await;
        if let Err(e) = &result {
            tracing::warn!(url, dest = %dest.display(), error = %e, "Image download failed");
        }
        result
    }
}

fn download_percent(written: u64, total: u64) -> f64 {
    if total == 0 {
        return DOWNLOAD_PROGRESS_BASE;
    }
    DOWNLOAD_PROGRESS_BASE + (written as f64 / total as f64) * DOWNLOAD_PROGRESS_SPAN
}

/// Map an SDK error onto the crate taxonomy using the service error code.
fn classify<E, R>(url: &str, err: SdkError<E, R>) -> ObjectError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match err.code() {
        Some("NoSuchKey") | Some("NoSuchBucket") | Some("NotFound") => {
            ObjectError::NotFound(url.to_string())
        }
        Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") => {
            ObjectError::Auth(format!("{url}: {err}"))
        }
        _ => ObjectError::Transport(format!("{url}: {err}")),
    }
}
