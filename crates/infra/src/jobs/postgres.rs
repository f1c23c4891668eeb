//! Postgres-backed job store implementation.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation) | `23505` | `DuplicateKey` | Concurrent submission with the same idempotency key |
//! | Database (other) | Any other | `Storage` | Constraint or query failures |
//! | PoolClosed / Io / Tls / PoolTimedOut | N/A | `Storage` | Database unreachable |
//!
//! ## Claims
//!
//! `update()` carries `AND status = $expected` in its WHERE clause, so the
//! PENDING → PROCESSING claim is atomic: of two workers racing on the same
//! row exactly one sees `rows_affected() == 1`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use jobforge_core::{Job, JobId, JobStatus, NewJob};

use super::store::{JobFilter, JobOrder, JobStats, JobStore, JobStoreError};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id              UUID PRIMARY KEY,
        idempotency_key VARCHAR(255) NOT NULL,
        type            VARCHAR(100) NOT NULL,
        payload         JSONB NOT NULL,
        status          VARCHAR(16) NOT NULL
            CHECK (status IN ('PENDING', 'PROCESSING', 'COMPLETED', 'FAILED')),
        priority        INTEGER NOT NULL DEFAULT 5,
        scheduled_at    TIMESTAMPTZ NULL,
        attempts        INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts    INTEGER NOT NULL DEFAULT 3 CHECK (max_attempts >= 1),
        result          JSONB NULL,
        error_message   TEXT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at      TIMESTAMPTZ NULL,
        finished_at     TIMESTAMPTZ NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS jobs_idempotency_key_idx ON jobs (idempotency_key)",
    "CREATE INDEX IF NOT EXISTS jobs_selection_idx ON jobs (status, priority, created_at)",
];

const COLUMNS: &str = "id, idempotency_key, type, payload, status, priority, scheduled_at, attempts, \
     max_attempts, result, error_message, created_at, updated_at, started_at, finished_at";

// $1 = status, $2 = eligible_at
const FILTER: &str = "($1::text IS NULL OR status = $1) \
     AND ($2::timestamptz IS NULL OR (status = 'PENDING' AND (scheduled_at IS NULL OR scheduled_at <= $2)))";

/// Postgres-backed job store.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; clones share it.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Build a store whose pool connects on first use.
    ///
    /// Connection failures surface from the first query (normally
    /// `prepare()`), where startup retries can handle them.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `jobs` table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn prepare(&self) -> Result<(), JobStoreError> {
        self.ensure_schema().await
    }

    #[instrument(skip(self, job), fields(idempotency_key = %job.idempotency_key, job_type = %job.job_type), err)]
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let key = job.idempotency_key.clone();
        let max_attempts = to_int4("max_attempts", job.max_attempts)?;
        let sql = format!(
            r#"
            INSERT INTO jobs (id, idempotency_key, type, payload, status, priority, scheduled_at, max_attempts)
            VALUES ($1, $2, $3, $4, 'PENDING', $5, $6, $7)
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(*JobId::new().as_uuid())
            .bind(&job.idempotency_key)
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(job.priority)
            .bind(job.scheduled_at)
            .bind(max_attempts)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    JobStoreError::DuplicateKey(key)
                } else {
                    map_sqlx_error("insert_job", e)
                }
            })?;

        job_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE idempotency_key = $1");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn scan(
        &self,
        filter: JobFilter,
        order: JobOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let order_by = match order {
            JobOrder::Created => "created_at ASC, id ASC",
            JobOrder::Selection => "priority ASC, created_at ASC, id ASC",
        };
        // LIMIT NULL means no limit.
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE {FILTER} ORDER BY {order_by} LIMIT $3");

        let rows = sqlx::query(&sql)
            .bind(filter.status.map(JobStatus::as_str))
            .bind(filter.eligible_at)
            .bind(limit.map(|l| l as i64))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("scan_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, to = %job.status, expected = %expected), err)]
    async fn update(&self, job: &Job, expected: JobStatus) -> Result<bool, JobStoreError> {
        let attempts = to_int4("attempts", job.attempts)?;
        let done = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $3,
                attempts = $4,
                result = $5,
                error_message = $6,
                scheduled_at = $7,
                started_at = $8,
                finished_at = $9,
                updated_at = $10
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(*job.id.as_uuid())
        .bind(expected.as_str())
        .bind(job.status.as_str())
        .bind(attempts)
        .bind(&job.result)
        .bind(&job.error_message)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if done.rows_affected() == 1 {
            return Ok(true);
        }

        // Distinguish "moved on" from "never existed".
        match self.get(job.id).await? {
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    #[instrument(skip(self), err)]
    async fn count(&self, filter: JobFilter) -> Result<u64, JobStoreError> {
        let sql = format!("SELECT COUNT(*) AS total FROM jobs WHERE {FILTER}");
        let row = sqlx::query(&sql)
            .bind(filter.status.map(JobStatus::as_str))
            .bind(filter.eligible_at)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| JobStoreError::Storage(format!("failed to read count: {e}")))?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, recent_failures: usize) -> Result<JobStats, JobStoreError> {
        let by_status = grouped_counts(&self.pool, "status").await?;
        let by_type = grouped_counts(&self.pool, "type").await?;

        let avg_row = sqlx::query(
            "SELECT COALESCE(AVG(attempts)::float8, 0) AS avg_attempts FROM jobs WHERE status = 'FAILED'",
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("avg_failed_attempts", e))?;
        let avg_attempts_failed: f64 = avg_row
            .try_get("avg_attempts")
            .map_err(|e| JobStoreError::Storage(format!("failed to read avg_attempts: {e}")))?;

        let sql = format!(
            "SELECT {COLUMNS} FROM jobs WHERE status = 'FAILED' \
             ORDER BY finished_at DESC NULLS LAST, created_at DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(recent_failures as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("recent_failures", e))?;

        Ok(JobStats {
            by_status,
            by_type,
            avg_attempts_failed,
            recent_failures: rows.iter().map(job_from_row).collect::<Result<_, _>>()?,
        })
    }
}

async fn grouped_counts(pool: &PgPool, column: &'static str) -> Result<BTreeMap<String, u64>, JobStoreError> {
    let sql = format!("SELECT {column} AS label, COUNT(*) AS total FROM jobs GROUP BY {column}");
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(|e| map_sqlx_error("grouped_counts", e))?;

    let mut counts = BTreeMap::new();
    for row in rows {
        let label: String = row
            .try_get("label")
            .map_err(|e| JobStoreError::Storage(format!("failed to read {column}: {e}")))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| JobStoreError::Storage(format!("failed to read count: {e}")))?;
        counts.insert(label, total.max(0) as u64);
    }
    Ok(counts)
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

/// Counters are `INTEGER` columns.
fn to_int4(column: &str, value: u32) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::Storage(format!("{column} {value} does not fit an INTEGER column")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation}: {} (code {})",
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed in {operation}")),
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("timed out waiting for a connection in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row type

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    idempotency_key: String,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    priority: i32,
    scheduled_at: Option<DateTime<Utc>>,
    attempts: i32,
    max_attempts: i32,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            job_type: row.try_get("type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            scheduled_at: row.try_get("scheduled_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Storage(format!("job {}: {e}", row.id)))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            idempotency_key: row.idempotency_key,
            job_type: row.job_type,
            payload: row.payload,
            status,
            priority: row.priority,
            scheduled_at: row.scheduled_at,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            result: row.result,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}
