//! Job store trait and SQLite implementation.

use crate::error::{StoreError, StoreResult};
use crate::models::{JobFilter, JobRecord, JobRow};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;
use volprov_core::JobStatus;

/// Error message written by the startup recovery sweep.
pub const RECOVERY_ERROR_MESSAGE: &str = "daemon restarted while job in progress";

/// Default page size for [`JobStore::list`].
const DEFAULT_LIST_LIMIT: u32 = 100;

/// Hard ceiling on caller-supplied list limits.
const MAX_LIST_LIMIT: u32 = 10_000;

/// Durable mapping of job id to job record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or update a record. Idempotent: replaying a save with the
    /// same state leaves storage unchanged.
    async fn save(&self, record: &JobRecord) -> StoreResult<()>;

    /// Fetch a record by id.
    async fn get(&self, job_id: Uuid) -> StoreResult<JobRecord>;

    /// List records, newest update first.
    async fn list(&self, filter: JobFilter) -> StoreResult<Vec<JobRecord>>;

    /// Flip every pending or running record to failed with the recovery
    /// message. Run exactly once at startup, before admitting requests.
    /// Returns the number of records swept.
    async fn fail_in_progress(&self) -> StoreResult<u64>;

    /// Delete terminal records whose last update is older than the cutoff.
    /// Returns the number of records removed.
    async fn delete_older_than(&self, older_than: Duration) -> StoreResult<u64>;

    /// Count records with the given status.
    async fn count(&self, status: JobStatus) -> StoreResult<u64>;
}

struct Migration {
    version: i64,
    sql: &'static str,
}

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    request_json TEXT NOT NULL,
    progress_json TEXT,
    error_message TEXT,
    cache_hit INTEGER,
    image_path TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON jobs(updated_at);
"#;

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: SCHEMA_V1,
}];

/// SQLite-backed job store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) the store at `path` and apply pending migrations.
    pub async fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // gives the single-writer transaction semantics the store promises.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Apply unapplied migrations in order, recording each applied version.
    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let current: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_one(&self.pool)
                .await?;

        for migration in MIGRATIONS {
            if migration.version <= current {
                continue;
            }
            tracing::info!(version = migration.version, "Applying schema migration");

            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
                .bind(migration.version)
                .bind(OffsetDateTime::now_utc().unix_timestamp())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn save(&self, record: &JobRecord) -> StoreResult<()> {
        let request_json =
            serde_json::to_string(&record.request).map_err(|e| StoreError::Corrupt {
                id: record.id.to_string(),
                reason: format!("unserializable request: {e}"),
            })?;
        let progress_json = record
            .progress
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                id: record.id.to_string(),
                reason: format!("unserializable progress: {e}"),
            })?;

        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, status, request_json, progress_json, error_message,
                 cache_hit, image_path, created_at, updated_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                progress_json = excluded.progress_json,
                error_message = excluded.error_message,
                cache_hit = excluded.cache_hit,
                image_path = excluded.image_path,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.status.as_str())
        .bind(&request_json)
        .bind(&progress_json)
        .bind(&record.error_message)
        .bind(record.cache_hit)
        .bind(&record.image_path)
        .bind(record.created_at.unix_timestamp())
        .bind(record.updated_at.unix_timestamp())
        .bind(record.completed_at.map(|t| t.unix_timestamp()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> StoreResult<JobRecord> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT id, status, request_json, progress_json, error_message,
                    cache_hit, image_path, created_at, updated_at, completed_at
             FROM jobs WHERE id = ?",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        row.try_into()
    }

    async fn list(&self, filter: JobFilter) -> StoreResult<Vec<JobRecord>> {
        let limit = match filter.limit {
            0 => DEFAULT_LIST_LIMIT,
            n => n.min(MAX_LIST_LIMIT),
        };

        let rows = match filter.status {
            Some(status) => {
                sqlx::query_as::<_, JobRow>(
                    "SELECT id, status, request_json, progress_json, error_message,
                            cache_hit, image_path, created_at, updated_at, completed_at
                     FROM jobs WHERE status = ?
                     ORDER BY updated_at DESC LIMIT ? OFFSET ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .bind(filter.offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(
                    "SELECT id, status, request_json, progress_json, error_message,
                            cache_hit, image_path, created_at, updated_at, completed_at
                     FROM jobs
                     ORDER BY updated_at DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(filter.offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn fail_in_progress(&self) -> StoreResult<u64> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let result = sqlx::query(
            "UPDATE jobs
             SET status = ?, error_message = ?, updated_at = ?, completed_at = ?
             WHERE status IN (?, ?)",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(RECOVERY_ERROR_MESSAGE)
        .bind(now)
        .bind(now)
        .bind(JobStatus::Pending.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        let swept = result.rows_affected();
        if swept > 0 {
            tracing::warn!(count = swept, "Marked interrupted jobs from previous run as failed");
        }
        Ok(swept)
    }

    async fn delete_older_than(&self, older_than: Duration) -> StoreResult<u64> {
        let cutoff = (OffsetDateTime::now_utc() - older_than).unix_timestamp();
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN (?, ?) AND updated_at < ?",
        )
        .bind(JobStatus::Completed.as_str())
        .bind(JobStatus::Failed.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::debug!(count = deleted, "Reaped old terminal job records");
        }
        Ok(deleted)
    }

    async fn count(&self, status: JobStatus) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
