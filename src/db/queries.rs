use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::db::{RecordKey, StoreError, StoredRecord};
use crate::models::job::{Job, JobResult, JobStatus};

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<JobStatus>()
        .map_err(|_| StoreError::Corrupt {
            key: format!("jobs/{id}"),
            reason: format!("unknown status '{status_str}'"),
        })?;

    let progress: i16 = row.try_get("progress")?;
    let result: Option<serde_json::Value> = row.try_get("result")?;
    let result = result
        .map(serde_json::from_value::<JobResult>)
        .transpose()?;

    Ok(Job {
        id,
        status,
        progress: progress.clamp(0, 100) as u8,
        result,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, status, progress, result, error, created_at, updated_at
        FROM jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Insert a job record unless one already exists
pub async fn insert_job(pool: &PgPool, job: &Job) -> Result<bool, StoreError> {
    let result = job.result.as_ref().map(serde_json::to_value).transpose()?;

    let done = sqlx::query(
        r#"
        INSERT INTO jobs (id, status, progress, result, error, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(job.id)
    .bind(job.status.as_str())
    .bind(i16::from(job.progress))
    .bind(result)
    .bind(job.error.as_deref())
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(done.rows_affected() > 0)
}

/// Insert or overwrite a job record. A terminal row is never overwritten.
pub async fn upsert_job(pool: &PgPool, job: &Job) -> Result<bool, StoreError> {
    let result = job.result.as_ref().map(serde_json::to_value).transpose()?;

    let done = sqlx::query(
        r#"
        INSERT INTO jobs (id, status, progress, result, error, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            progress = EXCLUDED.progress,
            result = EXCLUDED.result,
            error = EXCLUDED.error,
            updated_at = EXCLUDED.updated_at
        WHERE jobs.status NOT IN ('completed', 'failed')
        "#,
    )
    .bind(job.id)
    .bind(job.status.as_str())
    .bind(i16::from(job.progress))
    .bind(result)
    .bind(job.error.as_deref())
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(done.rows_affected() > 0)
}

/// Delete a job record
pub async fn delete_job(pool: &PgPool, job_id: Uuid) -> Result<bool, StoreError> {
    let done = sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;

    Ok(done.rows_affected() > 0)
}

/// Jobs created before the cutoff, oldest first
pub async fn stale_jobs(
    pool: &PgPool,
    created_before: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<StoredRecord>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, status, progress, result, error, created_at, updated_at
        FROM jobs
        WHERE created_at < $1
        ORDER BY created_at ASC
        LIMIT $2
        "#,
    )
    .bind(created_before)
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let job = job_from_row(row)?;
            Ok(StoredRecord {
                key: RecordKey::Job(job.id),
                size_bytes: job.size_bytes(),
                timestamp: job.created_at,
            })
        })
        .collect()
}
