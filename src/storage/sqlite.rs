//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Timestamps are stored
//! as epoch milliseconds, job states as their integer codes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;

use super::{JobFilter, JobStore, LockStore, StorageError, validate_spec};
use crate::core::job::{Job, JobSpec, JobState, JobType};
use crate::core::lock::{Lock, LockSpec};
use crate::core::types::{AssetId, JobId, LockId, OrganizationId};

/// Rows per INSERT when mapping assets; two binds per row stays under SQLite's bind limit.
const ASSET_BATCH_SIZE: usize = 400;

const JOB_COLUMNS: &str = "id, organization_id, name, job_type, state, lock_assets, attrs, env, \
     created_at, modified_at, started_at, stopped_at";

type JobRow = (
    String,
    String,
    String,
    i64,
    i64,
    bool,
    String,
    String,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
);

type LockRow = (String, String, String, i64);

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(persistence)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(persistence)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(persistence)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(persistence)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Persistence(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn persistence(e: impl std::fmt::Display) -> StorageError {
    StorageError::Persistence(e.to_string())
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Drop sub-millisecond precision so a record reads back equal to what was written.
fn truncate_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(to_millis(time))
}

fn parse_uuid<T: FromStr<Err = uuid::Error>>(kind: &str, s: &str) -> Result<T, StorageError> {
    s.parse()
        .map_err(|e| StorageError::Persistence(format!("invalid {} id '{}': {}", kind, s, e)))
}

fn job_from_row(row: JobRow) -> Result<Job, StorageError> {
    Ok(Job {
        id: parse_uuid("job", &row.0)?,
        organization_id: parse_uuid::<OrganizationId>("organization", &row.1)?,
        name: row.2,
        job_type: JobType::from_code(row.3)
            .ok_or_else(|| StorageError::Persistence(format!("invalid job type code: {}", row.3)))?,
        state: JobState::from_code(row.4)
            .ok_or_else(|| StorageError::Persistence(format!("invalid job state code: {}", row.4)))?,
        lock_assets: row.5,
        attrs: serde_json::from_str(&row.6).map_err(persistence)?,
        env: serde_json::from_str(&row.7).map_err(persistence)?,
        created_at: from_millis(row.8),
        modified_at: from_millis(row.9),
        started_at: row.10.map(from_millis),
        stopped_at: row.11.map(from_millis),
    })
}

fn lock_from_row(row: LockRow) -> Result<Lock, StorageError> {
    Ok(Lock {
        id: parse_uuid("lock", &row.0)?,
        asset_id: parse_uuid("asset", &row.1)?,
        job_id: parse_uuid("job", &row.2)?,
        created_at: from_millis(row.3),
    })
}

#[async_trait]
impl JobStore for SqliteStorage {
    async fn create(&self, spec: &JobSpec) -> Result<Job, StorageError> {
        validate_spec(spec)?;

        let mut job = Job::from_spec(spec);
        job.created_at = truncate_millis(job.created_at);
        job.modified_at = job.created_at;

        let attrs = serde_json::to_string(&job.attrs).map_err(persistence)?;
        let env = serde_json::to_string(&job.env).map_err(persistence)?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, organization_id, name, job_type, state, lock_assets, attrs, env,
                              created_at, modified_at, started_at, stopped_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.organization_id.to_string())
        .bind(&job.name)
        .bind(job.job_type.code())
        .bind(job.state.code())
        .bind(job.lock_assets)
        .bind(attrs)
        .bind(env)
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.modified_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                StorageError::Validation(format!("job name already in use: {}", spec.name)),
            ),
            Err(e) => Err(persistence(e)),
        }
    }

    async fn get(&self, id: &JobId) -> Result<Job, StorageError> {
        let row: JobRow =
            sqlx::query_as(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(persistence)?
                .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;

        job_from_row(row)
    }

    async fn get_by_name(&self, name: &str) -> Result<Job, StorageError> {
        let row: JobRow =
            sqlx::query_as(&format!("SELECT {} FROM jobs WHERE name = ?", JOB_COLUMNS))
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(persistence)?
                .ok_or_else(|| StorageError::NotFound(format!("job: {}", name)))?;

        job_from_row(row)
    }

    async fn get_waiting(&self, limit: usize) -> Result<Vec<Job>, StorageError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM jobs j
            WHERE j.state = ?
              AND NOT EXISTS (
                  SELECT 1 FROM job_assets ja
                  JOIN locks l ON l.asset_id = ja.asset_id
                  WHERE ja.job_id = j.id
              )
            ORDER BY j.created_at, j.id
            LIMIT ?
            "#,
            JOB_COLUMNS
        ))
        .bind(JobState::Waiting.code())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn get_running(&self) -> Result<Vec<Job>, StorageError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs WHERE state = ? ORDER BY created_at, id",
            JOB_COLUMNS
        ))
        .bind(JobState::Running.code())
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM jobs WHERE 1 = 1", JOB_COLUMNS));

        if !filter.states.is_empty() {
            query.push(" AND state IN (");
            let mut states = query.separated(", ");
            for state in &filter.states {
                states.push_bind(state.code());
            }
            states.push_unseparated(")");
        }
        if let Some(org) = filter.organization_id {
            query.push(" AND organization_id = ");
            query.push_bind(org.to_string());
        }

        query.push(" ORDER BY created_at, id LIMIT ");
        query.push_bind(filter.limit.map(|l| l as i64).unwrap_or(-1));
        query.push(" OFFSET ");
        query.push_bind(filter.offset as i64);

        let rows: Vec<JobRow> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn set_state(
        &self,
        id: &JobId,
        new_state: JobState,
        expected: Option<JobState>,
    ) -> Result<bool, StorageError> {
        let now = to_millis(Utc::now());

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE jobs SET state = ");
        query.push_bind(new_state.code());
        query.push(", modified_at = ");
        query.push_bind(now);
        if new_state.is_start_state() {
            query.push(", started_at = ");
            query.push_bind(now);
            query.push(", stopped_at = NULL");
        } else if new_state.is_stop_state() {
            query.push(", stopped_at = ");
            query.push_bind(now);
        }
        query.push(" WHERE id = ");
        query.push_bind(id.to_string());
        if let Some(expected) = expected {
            query.push(" AND state = ");
            query.push_bind(expected.code());
        }

        let result = query.build().execute(&self.pool).await.map_err(persistence)?;
        Ok(result.rows_affected() == 1)
    }

    async fn map_assets_to_job(&self, id: &JobId, assets: &[AssetId]) -> Result<(), StorageError> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;
        if exists.is_none() {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
        if assets.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(persistence)?;
        for chunk in assets.chunks(ASSET_BATCH_SIZE) {
            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT OR IGNORE INTO job_assets (job_id, asset_id) ");
            query.push_values(chunk, |mut row, asset| {
                row.push_bind(id.to_string()).push_bind(asset.to_string());
            });
            query.build().execute(&mut *tx).await.map_err(persistence)?;
        }
        tx.commit().await.map_err(persistence)?;
        Ok(())
    }

    async fn get_assets(&self, id: &JobId) -> Result<Vec<AssetId>, StorageError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT asset_id FROM job_assets WHERE job_id = ? ORDER BY rowid")
                .bind(id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(persistence)?;

        rows.into_iter()
            .map(|(asset,)| parse_uuid("asset", &asset))
            .collect()
    }
}

#[async_trait]
impl LockStore for SqliteStorage {
    async fn create(&self, spec: LockSpec) -> Result<Lock, StorageError> {
        let mut lock = Lock::from_spec(spec);
        lock.created_at = truncate_millis(lock.created_at);

        let result =
            sqlx::query("INSERT INTO locks (id, asset_id, job_id, created_at) VALUES (?, ?, ?, ?)")
                .bind(lock.id.to_string())
                .bind(lock.asset_id.to_string())
                .bind(lock.job_id.to_string())
                .bind(to_millis(lock.created_at))
                .execute(&self.pool)
                .await;

        match result {
            Ok(_) => Ok(lock),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                StorageError::Conflict(format!("asset already locked: {}", spec.asset_id)),
            ),
            Err(e) => Err(persistence(e)),
        }
    }

    async fn get(&self, id: &LockId) -> Result<Lock, StorageError> {
        let row: LockRow =
            sqlx::query_as("SELECT id, asset_id, job_id, created_at FROM locks WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(persistence)?
                .ok_or_else(|| StorageError::NotFound(format!("lock: {}", id)))?;

        lock_from_row(row)
    }

    async fn get_by_asset(&self, asset_id: &AssetId) -> Result<Lock, StorageError> {
        let row: LockRow =
            sqlx::query_as("SELECT id, asset_id, job_id, created_at FROM locks WHERE asset_id = ?")
                .bind(asset_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(persistence)?
                .ok_or_else(|| StorageError::NotFound(format!("lock on asset: {}", asset_id)))?;

        lock_from_row(row)
    }

    async fn list_by_job(&self, job_id: &JobId) -> Result<Vec<Lock>, StorageError> {
        let rows: Vec<LockRow> = sqlx::query_as(
            "SELECT id, asset_id, job_id, created_at FROM locks WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        rows.into_iter().map(lock_from_row).collect()
    }

    async fn delete(&self, id: &LockId) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM locks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(persistence)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_job(&self, job_id: &JobId) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM locks WHERE job_id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(persistence)?;

        Ok(result.rows_affected() as usize)
    }
}
