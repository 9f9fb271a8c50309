use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

use super::models::{ResourceSample, TelemetryRow};

// ─── Rolling aggregates ──────────────────────────────────────────────────────

pub async fn ensure_telemetry_row<'c, E>(exec: E, device_id: &str, now: DateTime<Utc>) -> sqlx::Result<()>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    sqlx::query("INSERT OR IGNORE INTO device_telemetry (device_id, updated_at) VALUES (?, ?)")
        .bind(device_id)
        .bind(now)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn get_telemetry<'c, E>(exec: E, device_id: &str) -> sqlx::Result<Option<TelemetryRow>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    sqlx::query_as::<_, TelemetryRow>("SELECT * FROM device_telemetry WHERE device_id = ?")
        .bind(device_id)
        .fetch_optional(exec)
        .await
}

pub async fn increment_sent(pool: &SqlitePool, device_id: &str, now: DateTime<Utc>) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;
    ensure_telemetry_row(&mut *tx, device_id, now).await?;
    sqlx::query(
        "UPDATE device_telemetry SET commands_sent = commands_sent + 1, updated_at = ? WHERE device_id = ?",
    )
    .bind(now)
    .bind(device_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}

/// Overwrite the outcome columns; callers compute them inside one transaction.
pub async fn write_outcome(conn: &mut SqliteConnection, row: &TelemetryRow) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE device_telemetry
         SET succeeded = ?, failed = ?, reliability = ?, avg_latency_ms = ?, latency_samples = ?, updated_at = ?
         WHERE device_id = ?",
    )
    .bind(row.succeeded)
    .bind(row.failed)
    .bind(row.reliability)
    .bind(row.avg_latency_ms)
    .bind(row.latency_samples)
    .bind(row.updated_at)
    .bind(&row.device_id)
    .execute(conn)
    .await?;
    Ok(())
}

// ─── Resource samples ────────────────────────────────────────────────────────

pub async fn insert_sample(pool: &SqlitePool, s: &ResourceSample, window: u32) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO resource_samples (device_id, recorded_at, cpu_percent, memory_percent, temperature_c, bandwidth_mbps)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&s.device_id)
    .bind(s.recorded_at)
    .bind(s.cpu_percent)
    .bind(s.memory_percent)
    .bind(s.temperature_c)
    .bind(s.bandwidth_mbps)
    .execute(&mut *tx)
    .await?;

    // Evict everything older than the newest `window` samples
    sqlx::query(
        "DELETE FROM resource_samples
         WHERE device_id = ? AND id NOT IN (
           SELECT id FROM resource_samples WHERE device_id = ? ORDER BY id DESC LIMIT ?
         )",
    )
    .bind(&s.device_id)
    .bind(&s.device_id)
    .bind(i64::from(window))
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

pub async fn list_samples(pool: &SqlitePool, device_id: &str) -> sqlx::Result<Vec<ResourceSample>> {
    sqlx::query_as::<_, ResourceSample>(
        "SELECT * FROM resource_samples WHERE device_id = ? ORDER BY id ASC",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await
}
