//! Provisioning request and job lifecycle types.
//!
//! The daemon's wire and storage layers both speak these types; serde does
//! the encoding at the boundary so statuses and stages stay exhaustive
//! enums internally.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A volume provisioning request, stored verbatim on the job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Absolute URL of the disk image in the object store.
    pub image_url: String,
    /// Target volume name, unique within the block-storage group.
    pub volume_name: String,
    /// Target volume size in gibibytes.
    pub volume_size_gb: u64,
    /// Source image format.
    #[serde(default)]
    pub image_type: ImageFormat,
    /// Optional client-supplied correlation tag, echoed in status views.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ProvisionRequest {
    /// Validate the request at admission time.
    ///
    /// Returns every violated constraint so the API can itemize them.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.image_url.trim().is_empty() {
            problems.push("image_url must not be empty".to_string());
        } else if !self.image_url.starts_with("http://") && !self.image_url.starts_with("https://")
        {
            problems.push(format!(
                "image_url must be an absolute http(s) URL, got '{}'",
                self.image_url
            ));
        }

        if self.volume_name.trim().is_empty() {
            problems.push("volume_name must not be empty".to_string());
        } else if let Err(e) = validate_volume_name(&self.volume_name) {
            problems.push(e.to_string());
        }

        if self.volume_size_gb == 0 {
            problems.push("volume_size_gb must be a positive integer".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(problems))
        }
    }
}

/// Validate a block-volume or volume-group identifier.
///
/// Names are passed to host tooling, so they must be plain host
/// identifiers: leading alphanumeric, then alphanumerics, `_`, `.`, `-`.
pub fn validate_volume_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("name must not be empty".to_string()));
    }
    if name.contains("..") {
        return Err(Error::InvalidName(format!(
            "'{name}' must not contain '..'"
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('/');
    if !first.is_ascii_alphanumeric() {
        return Err(Error::InvalidName(format!(
            "'{name}' must start with an alphanumeric character"
        )));
    }
    for c in chars {
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-') {
            return Err(Error::InvalidName(format!(
                "'{name}' contains forbidden character '{}'",
                c.escape_default()
            )));
        }
    }
    Ok(())
}

/// Source image format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// A compressed image (QCOW2) converted to raw during populate.
    #[default]
    #[serde(alias = "qcow2")]
    Compressed,
    /// A raw image, block-copied directly onto the device.
    Raw,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compressed => "compressed",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status.
///
/// Transitions are monotonic: pending -> running -> {completed, failed},
/// with pending -> failed permitted for cancellation before a permit is
/// acquired. Terminal statuses never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the status is terminal (completed or failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidName(format!("unknown job status '{other}'"))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered pipeline stages reported through job progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Initializing,
    CheckingCache,
    Downloading,
    CreatingVolume,
    Converting,
    Finalizing,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::CheckingCache => "checking_cache",
            Self::Downloading => "downloading",
            Self::CreatingVolume => "creating_volume",
            Self::Converting => "converting",
            Self::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time progress for a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub stage: ProgressStage,
    pub percent: f64,
    pub bytes_processed: u64,
    pub bytes_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            image_url: "http://obj/images/ubuntu.qcow2".to_string(),
            volume_name: "vm-1".to_string(),
            volume_size_gb: 10,
            image_type: ImageFormat::Compressed,
            correlation_id: None,
        }
    }

    #[test]
    fn valid_request_passes() {
        request().validate().unwrap();
    }

    #[test]
    fn zero_size_rejected() {
        let mut req = request();
        req.volume_size_gb = 0;
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("volume_size_gb"));
    }

    #[test]
    fn validation_errors_are_itemized() {
        let req = ProvisionRequest {
            image_url: String::new(),
            volume_name: String::new(),
            volume_size_gb: 0,
            image_type: ImageFormat::Raw,
            correlation_id: None,
        };
        match req.validate() {
            Err(Error::Validation(problems)) => assert_eq!(problems.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn relative_url_rejected() {
        let mut req = request();
        req.image_url = "obj/images/ubuntu.qcow2".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn volume_name_rules() {
        assert!(validate_volume_name("vm-1").is_ok());
        assert!(validate_volume_name("vm_1.root").is_ok());
        assert!(validate_volume_name("").is_err());
        assert!(validate_volume_name("-leading").is_err());
        assert!(validate_volume_name("a/b").is_err());
        assert!(validate_volume_name("a\\b").is_err());
        assert!(validate_volume_name("a..b").is_err());
        assert!(validate_volume_name("a\x07b").is_err());
    }

    #[test]
    fn image_format_accepts_qcow2_alias() {
        let fmt: ImageFormat = serde_json::from_str("\"qcow2\"").unwrap();
        assert_eq!(fmt, ImageFormat::Compressed);
        let fmt: ImageFormat = serde_json::from_str("\"compressed\"").unwrap();
        assert_eq!(fmt, ImageFormat::Compressed);
        let fmt: ImageFormat = serde_json::from_str("\"raw\"").unwrap();
        assert_eq!(fmt, ImageFormat::Raw);
    }

    #[test]
    fn unknown_status_rejected() {
        assert!("cancelled".parse::<JobStatus>().is_err());
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
    }

    #[test]
    fn status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
