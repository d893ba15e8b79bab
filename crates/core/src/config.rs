//! Daemon configuration.
//!
//! The runtime environment speaks flat variables (`PORT`, `MINIO_ENDPOINT`,
//! `LVM_VOLUME_GROUP`, ...); figment maps them onto this nested structure
//! over serialized defaults, so every component receives one injected
//! config struct and never touches the environment itself.

use crate::error::{Error, Result};
use crate::retry::{schedule_from_env, RetryPolicy};
use crate::types::validate_volume_name;
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level daemon configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub block_storage: BlockStorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Listen socket configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Job store location.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

/// Object-store access and network retry tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_network_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_network_backoff")]
    pub retry_backoff_ms: String,
}

impl ObjectStoreConfig {
    /// Resolve the network retry policy from the configured schedule.
    pub fn retry_policy(&self) -> RetryPolicy {
        schedule_from_env(
            self.retry_attempts,
            &self.retry_backoff_ms,
            &RetryPolicy::network_defaults(),
        )
    }
}

/// Block-storage group and retry tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockStorageConfig {
    #[serde(default = "default_volume_group")]
    pub volume_group: String,
    #[serde(default = "default_block_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_block_backoff")]
    pub retry_backoff_ms: String,
}

impl BlockStorageConfig {
    /// Resolve the block-storage retry policy from the configured schedule.
    pub fn retry_policy(&self) -> RetryPolicy {
        schedule_from_env(
            self.retry_attempts,
            &self.retry_backoff_ms,
            &RetryPolicy::block_defaults(),
        )
    }
}

/// Image cache location.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
}

/// Job manager knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Global concurrency ceiling for provisioning workers.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-job wall-clock budget in minutes.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Terminal records older than this are reaped by housekeeping.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

/// Authentication material consumed by the fronting listener and the
/// bearer-token middleware.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub api_tokens_file: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./provisioner.db")
}

fn default_endpoint() -> String {
    "https://minio.example.com".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_network_attempts() -> u32 {
    3
}

fn default_network_backoff() -> String {
    "100,1000,10000".to_string()
}

fn default_volume_group() -> String {
    "data".to_string()
}

fn default_block_attempts() -> u32 {
    2
}

fn default_block_backoff() -> String {
    "100,1000".to_string()
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("/var/lib/libvirt/images")
}

fn default_max_concurrent() -> usize {
    2
}

fn default_timeout_minutes() -> u64 {
    30
}

fn default_retention_days() -> u64 {
    7
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            access_key: String::new(),
            secret_key: String::new(),
            region: default_region(),
            retry_attempts: default_network_attempts(),
            retry_backoff_ms: default_network_backoff(),
        }
    }
}

impl Default for BlockStorageConfig {
    fn default() -> Self {
        Self {
            volume_group: default_volume_group(),
            retry_attempts: default_block_attempts(),
            retry_backoff_ms: default_block_backoff(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_minutes: default_timeout_minutes(),
            retention_days: default_retention_days(),
        }
    }
}

/// Environment variables the daemon understands, with their nested keys.
const ENV_KEYS: &[(&str, &str)] = &[
    ("PORT", "server.port"),
    ("HOST", "server.host"),
    ("DATABASE_PATH", "database.path"),
    ("MINIO_ENDPOINT", "object_store.endpoint"),
    ("MINIO_ACCESS_KEY", "object_store.access_key"),
    ("MINIO_SECRET_KEY", "object_store.secret_key"),
    ("MINIO_REGION", "object_store.region"),
    ("MINIO_RETRY_ATTEMPTS", "object_store.retry_attempts"),
    ("MINIO_RETRY_BACKOFF_MS", "object_store.retry_backoff_ms"),
    ("LVM_VOLUME_GROUP", "block_storage.volume_group"),
    ("LVM_RETRY_ATTEMPTS", "block_storage.retry_attempts"),
    ("LVM_RETRY_BACKOFF_MS", "block_storage.retry_backoff_ms"),
    ("CACHE_DIR", "cache.root"),
    ("MAX_CONCURRENT_JOBS", "jobs.max_concurrent"),
    ("JOB_TIMEOUT_MINUTES", "jobs.timeout_minutes"),
    ("JOB_RETENTION_DAYS", "jobs.retention_days"),
    ("CLIENT_CA_CERT", "auth.client_ca_cert"),
    ("API_TOKENS_FILE", "auth.api_tokens_file"),
];

/// Standard-name aliases accepted at lower precedence than the primary
/// variables.
const ENV_ALIASES: &[(&str, &str)] = &[
    ("MINIO_ACCESS_KEY_ID", "object_store.access_key"),
    ("MINIO_SECRET_ACCESS_KEY", "object_store.secret_key"),
];

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        for &(var, key) in ENV_ALIASES {
            if let Ok(value) = std::env::var(var) {
                figment = figment.merge(Serialized::default(key, value));
            }
        }

        let names: Vec<&str> = ENV_KEYS.iter().map(|(var, _)| *var).collect();
        let env = Env::raw()
            .only(&names)
            .map(|key| {
                for (var, nested) in ENV_KEYS {
                    if key.as_str().eq_ignore_ascii_case(var) {
                        return (*nested).into();
                    }
                }
                key.as_str().to_owned().into()
            })
            .split(".");
        figment = figment.merge(env);

        let config: AppConfig = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let endpoint = &self.object_store.endpoint;
        let host = endpoint
            .strip_prefix("http://")
            .or_else(|| endpoint.strip_prefix("https://"))
            .ok_or_else(|| {
                Error::Config(format!(
                    "MINIO_ENDPOINT '{endpoint}' must be an http(s) URL"
                ))
            })?;
        if host.is_empty() || host.starts_with('/') {
            return Err(Error::Config(format!(
                "MINIO_ENDPOINT '{endpoint}' is missing a hostname"
            )));
        }

        validate_volume_name(&self.block_storage.volume_group)
            .map_err(|e| Error::Config(format!("LVM_VOLUME_GROUP: {e}")))?;

        if self.jobs.max_concurrent == 0 {
            return Err(Error::Config(
                "MAX_CONCURRENT_JOBS must be at least 1".to_string(),
            ));
        }
        if self.jobs.timeout_minutes == 0 {
            return Err(Error::Config(
                "JOB_TIMEOUT_MINUTES must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The socket address string to bind the listener to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
