//! The object-store capability contract.

use crate::error::{ObjectError, ObjectResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use volprov_core::ProgressSink;

/// Capabilities the provisioning pipeline needs from the object store.
///
/// Implementations wrap every operation in the network retry policy, so
/// callers observe retries as a single opaque attempt. All operations are
/// cancellable; cancellation is propagated, never retried.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Size of the object in bytes.
    async fn stat(&self, url: &str, cancel: &CancellationToken) -> ObjectResult<u64>;

    /// Fetch a small sidecar object in full. Bounded: implementations
    /// refuse objects larger than a few kilobytes.
    async fn get_small(&self, url: &str, cancel: &CancellationToken) -> ObjectResult<Bytes>;

    /// Stream the object to `dest`, ticking `sink` per chunk.
    ///
    /// On success every byte has been written, fsynced, and verified
    /// against [`ObjectClient::stat`]. On failure the partially written
    /// file is left for the caller to remove. Returns the byte count.
    async fn stream_to(
        &self,
        url: &str,
        dest: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> ObjectResult<u64>;
}

/// Split an absolute image URL into bucket and object key.
///
/// The endpoint host is configured separately; only the URL path matters
/// here. The first segment is the bucket, the remainder the object key.
pub(crate) fn parse_object_url(url: &str) -> ObjectResult<(String, String)> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| ObjectError::InvalidUrl(format!("'{url}' is not an http(s) URL")))?;

    let path = match rest.split_once('/') {
        Some((_host, path)) => path,
        None => "",
    };

    match path.split_once('/') {
        Some((bucket, object)) if !bucket.is_empty() && !object.is_empty() => {
            Ok((bucket.to_string(), object.to_string()))
        }
        _ => Err(ObjectError::InvalidUrl(format!(
            "'{url}' must name a bucket and an object"
        ))),
    }
}
