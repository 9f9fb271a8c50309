use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{ContentAsset, ContentKind, SyncRecord};

// ─── Content assets ──────────────────────────────────────────────────────────

pub struct NewAsset<'a> {
    pub name: &'a str,
    pub kind: ContentKind,
    pub url: &'a str,
    pub checksum: &'a str,
    pub size_bytes: i64,
    pub duration_secs: Option<i64>,
}

pub async fn insert_asset(
    pool: &SqlitePool,
    asset: &NewAsset<'_>,
    now: DateTime<Utc>,
) -> sqlx::Result<ContentAsset> {
    sqlx::query_as::<_, ContentAsset>(
        "INSERT INTO content_assets (name, kind, url, checksum, size_bytes, duration_secs, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(asset.name)
    .bind(asset.kind)
    .bind(asset.url)
    .bind(asset.checksum)
    .bind(asset.size_bytes)
    .bind(asset.duration_secs)
    .bind(now)
    .fetch_one(pool)
    .await
}

pub async fn get_asset(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<ContentAsset>> {
    sqlx::query_as::<_, ContentAsset>("SELECT * FROM content_assets WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list_assets(pool: &SqlitePool) -> sqlx::Result<Vec<ContentAsset>> {
    sqlx::query_as::<_, ContentAsset>("SELECT * FROM content_assets ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
}

// ─── Sync records ────────────────────────────────────────────────────────────

/// Create the record, or reset an existing assignment back to a fresh `Pending`.
pub async fn upsert_sync_record(pool: &SqlitePool, r: &SyncRecord) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO sync_records (device_id, content_id, status, progress, bytes_downloaded, retry_count, next_retry_at, last_error, schedule_start, schedule_end, assigned_at, updated_at, version)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
         ON CONFLICT(device_id, content_id) DO UPDATE SET
           status = excluded.status,
           progress = excluded.progress,
           bytes_downloaded = excluded.bytes_downloaded,
           retry_count = excluded.retry_count,
           next_retry_at = excluded.next_retry_at,
           last_error = excluded.last_error,
           schedule_start = excluded.schedule_start,
           schedule_end = excluded.schedule_end,
           assigned_at = excluded.assigned_at,
           updated_at = excluded.updated_at,
           version = sync_records.version + 1",
    )
    .bind(&r.device_id)
    .bind(r.content_id)
    .bind(r.status)
    .bind(r.progress)
    .bind(r.bytes_downloaded)
    .bind(r.retry_count)
    .bind(r.next_retry_at)
    .bind(&r.last_error)
    .bind(r.schedule_start)
    .bind(r.schedule_end)
    .bind(r.assigned_at)
    .bind(r.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_sync_record(
    pool: &SqlitePool,
    device_id: &str,
    content_id: i64,
) -> sqlx::Result<Option<SyncRecord>> {
    sqlx::query_as::<_, SyncRecord>(
        "SELECT * FROM sync_records WHERE device_id = ? AND content_id = ?",
    )
    .bind(device_id)
    .bind(content_id)
    .fetch_optional(pool)
    .await
}

/// Compare-and-set on the record's `version`.
pub async fn save_sync_record(pool: &SqlitePool, r: &SyncRecord) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE sync_records SET
           status = ?, progress = ?, bytes_downloaded = ?, retry_count = ?, next_retry_at = ?,
           last_error = ?, updated_at = ?, version = version + 1
         WHERE device_id = ? AND content_id = ? AND version = ?",
    )
    .bind(r.status)
    .bind(r.progress)
    .bind(r.bytes_downloaded)
    .bind(r.retry_count)
    .bind(r.next_retry_at)
    .bind(&r.last_error)
    .bind(r.updated_at)
    .bind(&r.device_id)
    .bind(r.content_id)
    .bind(r.version)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn list_sync_for_device(pool: &SqlitePool, device_id: &str) -> sqlx::Result<Vec<SyncRecord>> {
    sqlx::query_as::<_, SyncRecord>(
        "SELECT * FROM sync_records WHERE device_id = ? ORDER BY assigned_at ASC, content_id ASC",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await
}

pub async fn list_sync_for_content(pool: &SqlitePool, content_id: i64) -> sqlx::Result<Vec<SyncRecord>> {
    sqlx::query_as::<_, SyncRecord>(
        "SELECT * FROM sync_records WHERE content_id = ? ORDER BY device_id ASC",
    )
    .bind(content_id)
    .fetch_all(pool)
    .await
}

/// Failed records with a retry scheduled, optionally for one device.
pub async fn list_scheduled_retries(
    pool: &SqlitePool,
    device_id: Option<&str>,
) -> sqlx::Result<Vec<SyncRecord>> {
    sqlx::query_as::<_, SyncRecord>(
        "SELECT * FROM sync_records
         WHERE status = 'failed' AND next_retry_at IS NOT NULL AND (? IS NULL OR device_id = ?)",
    )
    .bind(device_id)
    .bind(device_id)
    .fetch_all(pool)
    .await
}
