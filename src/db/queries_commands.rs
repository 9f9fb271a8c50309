use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{CommandRow, CommandStatus, FailureReason};

// Every status write is conditional on the status it leaves, so concurrent
// delivery/ack/timeout paths can never move a command backwards.

pub async fn insert_command(pool: &SqlitePool, c: &CommandRow) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO commands (id, device_id, kind, payload, status, response, failure_reason, issued_by, issued_at, sent_at, last_delivered_at, delivery_attempts, acknowledged_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&c.id)
    .bind(&c.device_id)
    .bind(&c.kind)
    .bind(&c.payload)
    .bind(c.status)
    .bind(&c.response)
    .bind(c.failure_reason)
    .bind(&c.issued_by)
    .bind(c.issued_at)
    .bind(c.sent_at)
    .bind(c.last_delivered_at)
    .bind(c.delivery_attempts)
    .bind(c.acknowledged_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_command(pool: &SqlitePool, id: &str) -> sqlx::Result<Option<CommandRow>> {
    sqlx::query_as::<_, CommandRow>("SELECT * FROM commands WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list_commands_for_device(
    pool: &SqlitePool,
    device_id: &str,
    limit: i64,
) -> sqlx::Result<Vec<CommandRow>> {
    sqlx::query_as::<_, CommandRow>(
        "SELECT * FROM commands WHERE device_id = ? ORDER BY issued_at DESC LIMIT ?",
    )
    .bind(device_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Commands the device still has to apply: never delivered, or delivered but unacknowledged.
pub async fn list_outstanding_for_device(
    pool: &SqlitePool,
    device_id: &str,
) -> sqlx::Result<Vec<CommandRow>> {
    sqlx::query_as::<_, CommandRow>(
        "SELECT * FROM commands
         WHERE device_id = ? AND status IN ('pending', 'sent')
         ORDER BY issued_at ASC",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await
}

pub async fn list_commands_with_status(
    pool: &SqlitePool,
    status: CommandStatus,
) -> sqlx::Result<Vec<CommandRow>> {
    sqlx::query_as::<_, CommandRow>("SELECT * FROM commands WHERE status = ? ORDER BY issued_at ASC")
        .bind(status)
        .fetch_all(pool)
        .await
}

/// `Pending -> Sent`. Returns `false` if the command was no longer pending.
pub async fn mark_sent(pool: &SqlitePool, id: &str, now: DateTime<Utc>) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE commands
         SET status = 'sent', sent_at = ?, last_delivered_at = ?, delivery_attempts = delivery_attempts + 1
         WHERE id = ? AND status = 'pending'",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Bookkeeping for a repeated delivery of an already-sent command.
pub async fn record_redelivery(pool: &SqlitePool, id: &str, now: DateTime<Utc>) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE commands
         SET last_delivered_at = ?, delivery_attempts = delivery_attempts + 1
         WHERE id = ? AND status = 'sent'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `Sent -> Acknowledged | Failed`. Returns `false` if the command had already left `Sent`.
pub async fn finish_command(
    pool: &SqlitePool,
    id: &str,
    status: CommandStatus,
    response: Option<&str>,
    reason: Option<FailureReason>,
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE commands
         SET status = ?, response = ?, failure_reason = ?, acknowledged_at = ?
         WHERE id = ? AND status = 'sent'",
    )
    .bind(status)
    .bind(response)
    .bind(reason)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `Pending -> Failed` for a command that never reached its device.
pub async fn expire_undelivered(pool: &SqlitePool, id: &str, now: DateTime<Utc>) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE commands SET status = 'failed', failure_reason = 'undelivered', acknowledged_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `Pending -> Cancelled`. Returns `false` once the command has been sent.
pub async fn cancel_command(pool: &SqlitePool, id: &str, now: DateTime<Utc>) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE commands SET status = 'cancelled', acknowledged_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}
