//! LVM implementation of the block driver.

use crate::driver::{BlockDriver, VolumeInfo};
use crate::error::{BlockError, BlockResult};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use volprov_core::types::validate_volume_name;
use volprov_core::{ImageFormat, ProgressSink, ProgressStage, RetryPolicy};

/// LVM driver for a single volume group.
pub struct LvmDriver {
    vg_name: String,
    retry: RetryPolicy,
}

impl LvmDriver {
    /// Build a driver for `vg_name`. The group name is validated here so
    /// no later operation can smuggle separators into a command line.
    pub fn new(vg_name: impl Into<String>, retry: RetryPolicy) -> BlockResult<Self> {
        let vg_name = vg_name.into();
        validate_volume_name(&vg_name).map_err(|e| BlockError::InvalidName(e.to_string()))?;
        Ok(Self { vg_name, retry })
    }

    pub fn volume_group(&self) -> &str {
        &self.vg_name
    }

    /// Verify the volume group is reachable and the required host tools
    /// respond. Called once at startup, before requests are admitted.
    pub async fn health_check(&self) -> BlockResult<()> {
        self.run_tool("vgs", &[&self.vg_name]).await?;
        self.run_tool("qemu-img", &["--version"]).await?;
        Ok(())
    }

    /// Run a host tool to completion, capturing output.
    async fn run_tool(&self, tool: &str, args: &[&str]) -> BlockResult<String> {
        let output = Command::new(tool)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BlockError::Spawn {
                tool: tool.to_string(),
                source: e,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(BlockError::CommandFailed {
                tool: tool.to_string(),
                status: output.status.to_string(),
                output: combined_output(&output),
            })
        }
    }

    /// Run a host tool, killing it if the cancellation token fires first.
    async fn run_tool_cancellable(
        &self,
        tool: &str,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> BlockResult<String> {
        let mut command = Command::new(tool);
        command.args(args).kill_on_drop(true);

        tokio::select! {
            output = command.output() => {
                let output = output.map_err(|e| BlockError::Spawn {
                    tool: tool.to_string(),
                    source: e,
                })?;
                if output.status.success() {
                    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
                } else {
                    Err(BlockError::CommandFailed {
                        tool: tool.to_string(),
                        status: output.status.to_string(),
                        output: combined_output(&output),
                    })
                }
            }
            _ = cancel.cancelled() => Err(BlockError::Cancelled),
        }
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}/{}", self.vg_name, name)
    }

    fn device_path(&self, name: &str) -> String {
        format!("/dev/{}/{}", self.vg_name, name)
    }

    fn validated(&self, name: &str) -> BlockResult<()> {
        validate_volume_name(name).map_err(|e| BlockError::InvalidName(e.to_string()))
    }

    async fn populate_once(
        &self,
        image_path: &Path,
        name: &str,
        format: ImageFormat,
        cancel: &CancellationToken,
    ) -> BlockResult<()> {
        let device = self.device_path(name);
        let image = image_path.to_string_lossy();

        match format {
            ImageFormat::Compressed => {
                self.run_tool_cancellable(
                    "qemu-img",
                    &["convert", "-f", "qcow2", "-O", "raw", &image, &device],
                    cancel,
                )
                .await?;
            }
            ImageFormat::Raw => {
                let if_arg = format!("if={image}");
                let of_arg = format!("of={device}");
                self.run_tool_cancellable(
                    "dd",
                    &[&if_arg, &of_arg, "bs=4M", "conv=fdatasync"],
                    cancel,
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlockDriver for LvmDriver {
    async fn create(&self, name: &str, size_gib: u64) -> BlockResult<()> {
        self.validated(name)?;
        if self.exists(name).await? {
            return Err(BlockError::AlreadyExists(self.qualified(name)));
        }

        let size_arg = format!("{size_gib}G");
        self.run_tool("lvcreate", &["-L", &size_arg, "-n", name, &self.vg_name])
            .await?;
        tracing::info!(volume = %self.qualified(name), size_gib, "Created block volume");
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
        self.validated(name)?;

        let outcome = self
            .retry
            .run(cancel, || {
                self.populate_once(image_path, name, format, cancel)
            })
            .await;

        match outcome {
            Ok(()) => {
                sink.update(ProgressStage::Converting, 90.0, 0, 0);
                tracing::info!(
                    volume = %self.qualified(name),
                    image = %image_path.display(),
                    format = %format,
                    "Populated block volume"
                );
                Ok(())
            }
            Err(e) => Err(BlockError::from_retry(e)),
        }
    }

    async fn delete(&self, name: &str) -> BlockResult<()> {
        self.validated(name)?;
        if !self.exists(name).await? {
            return Ok(());
        }
        self.run_tool("lvremove", &["-f", &self.qualified(name)])
            .await?;
        tracing::info!(volume = %self.qualified(name), "Deleted block volume");
        Ok(())
    }

    async fn exists(&self, name: &str) -> BlockResult<bool> {
        self.validated(name)?;
        match self.run_tool("lvs", &[&self.qualified(name)]).await {
            Ok(_) => Ok(true),
            Err(BlockError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn info(&self, name: &str) -> BlockResult<VolumeInfo> {
        self.validated(name)?;
        let output = self
            .run_tool(
                "lvs",
                &[
                    "--units",
                    "b",
                    "--noheadings",
                    "-o",
                    "lv_name,lv_size,lv_attr",
                    &self.qualified(name),
                ],
            )
            .await
            .map_err(|e| match e {
                BlockError::CommandFailed { .. } => BlockError::NotFound(self.qualified(name)),
                other => other,
            })?;

        parse_info_output(&output)
    }

    async fn list(&self) -> BlockResult<Vec<String>> {
        let output = self
            .run_tool("lvs", &["--noheadings", "-o", "lv_name", &self.vg_name])
            .await?;
        Ok(parse_list_output(&output))
    }
}

fn combined_output(output: &std::process::Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !combined.trim().is_empty() {
            combined.push('\n');
        }
        combined.push_str(stderr.trim_end());
    }
    combined.trim().to_string()
}

fn parse_info_output(output: &str) -> BlockResult<VolumeInfo> {
    let fields: Vec<&str> = output.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(BlockError::UnexpectedOutput {
            tool: "lvs".to_string(),
            detail: format!("expected name, size, attrs; got '{}'", output.trim()),
        });
    }

    let size_bytes = fields[1]
        .trim_end_matches(['B', 'b'])
        .parse::<u64>()
        .map_err(|e| BlockError::UnexpectedOutput {
            tool: "lvs".to_string(),
            detail: format!("bad volume size '{}': {e}", fields[1]),
        })?;

    Ok(VolumeInfo {
        name: fields[0].to_string(),
        size_bytes,
        attributes: fields[2].to_string(),
    })
}

fn parse_list_output(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
