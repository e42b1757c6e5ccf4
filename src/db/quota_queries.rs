use sqlx::{PgPool, Row};

use crate::db::StoreError;
use crate::models::quota::QuotaSnapshot;

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Latest persisted quota row
pub async fn latest_snapshot(pool: &PgPool) -> Result<Option<QuotaSnapshot>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT day, reads, writes, deletes, storage_bytes
        FROM quota_usage
        ORDER BY day DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(QuotaSnapshot {
        day: row.try_get("day")?,
        reads: from_db(row.try_get("reads")?),
        writes: from_db(row.try_get("writes")?),
        deletes: from_db(row.try_get("deletes")?),
        storage_bytes: from_db(row.try_get("storage_bytes")?),
    }))
}

/// Write the counters for `snapshot.day`
pub async fn save_snapshot(pool: &PgPool, snapshot: &QuotaSnapshot) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO quota_usage (day, reads, writes, deletes, storage_bytes, updated_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        ON CONFLICT (day) DO UPDATE
        SET reads = EXCLUDED.reads,
            writes = EXCLUDED.writes,
            deletes = EXCLUDED.deletes,
            storage_bytes = EXCLUDED.storage_bytes,
            updated_at = NOW()
        "#,
    )
    .bind(snapshot.day)
    .bind(to_db(snapshot.reads))
    .bind(to_db(snapshot.writes))
    .bind(to_db(snapshot.deletes))
    .bind(to_db(snapshot.storage_bytes))
    .execute(pool)
    .await?;

    Ok(())
}
