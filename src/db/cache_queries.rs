use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::db::{RecordKey, StoreError, StoredRecord};
use crate::models::cache::CacheEntry;

fn entry_from_row(row: &PgRow) -> Result<CacheEntry, StoreError> {
    let result: serde_json::Value = row.try_get("result")?;
    Ok(CacheEntry {
        fingerprint: row.try_get("fingerprint")?,
        result: serde_json::from_value(result)?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

/// Look up a cached result by fingerprint
pub async fn get_entry(pool: &PgPool, fingerprint: &str) -> Result<Option<CacheEntry>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT fingerprint, result, created_at, expires_at
        FROM result_cache
        WHERE fingerprint = $1
        "#,
    )
    .bind(fingerprint)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Insert or refresh a cached result
pub async fn upsert_entry(pool: &PgPool, entry: &CacheEntry) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO result_cache (fingerprint, result, created_at, expires_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (fingerprint) DO UPDATE
        SET result = EXCLUDED.result,
            created_at = EXCLUDED.created_at,
            expires_at = EXCLUDED.expires_at
        "#,
    )
    .bind(&entry.fingerprint)
    .bind(serde_json::to_value(&entry.result)?)
    .bind(entry.created_at)
    .bind(entry.expires_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_entry(pool: &PgPool, fingerprint: &str) -> Result<bool, StoreError> {
    let done = sqlx::query("DELETE FROM result_cache WHERE fingerprint = $1")
        .bind(fingerprint)
        .execute(pool)
        .await?;

    Ok(done.rows_affected() > 0)
}

/// Entries past their expiry, oldest expiry first
pub async fn expired_entries(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<StoredRecord>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT fingerprint, result, created_at, expires_at
        FROM result_cache
        WHERE expires_at <= $1
        ORDER BY expires_at ASC
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let entry = entry_from_row(row)?;
            Ok(StoredRecord {
                size_bytes: entry.size_bytes(),
                timestamp: entry.expires_at,
                key: RecordKey::Cache(entry.fingerprint),
            })
        })
        .collect()
}
