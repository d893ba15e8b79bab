//! The block-storage capability contract.

use crate::error::BlockResult;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use volprov_core::{ImageFormat, ProgressSink};

/// Details of one volume in the group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub size_bytes: u64,
    pub attributes: String,
}

/// Operations on a single named block-storage group.
#[async_trait]
pub trait BlockDriver: Send + Sync {
    /// Create a new volume of `size_gib` gibibytes. Fails when the name
    /// already exists; never reuses or resizes an existing volume.
    async fn create(&self, name: &str, size_gib: u64) -> BlockResult<()>;

    /// Write the image at `image_path` into the device backing `name`,
    /// converting compressed images to raw on the way. On failure the
    /// device contents are indeterminate and the caller must delete the
    /// volume.
    async fn populate(
        &self,
        image_path: &Path,
        name: &str,
        format: ImageFormat,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> BlockResult<()>;

    /// Best-effort removal; ok when the volume does not exist.
    async fn delete(&self, name: &str) -> BlockResult<()>;

    /// Whether the volume exists.
    async fn exists(&self, name: &str) -> BlockResult<bool>;

    /// Size and attributes of an existing volume.
    async fn info(&self, name: &str) -> BlockResult<VolumeInfo>;

    /// Names of all volumes in the group.
    async fn list(&self) -> BlockResult<Vec<String>>;
}
