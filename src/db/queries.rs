use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::models::{Device, DeviceState};

/// Search criteria for the device list. Absent fields do not filter.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct DeviceFilter {
    pub name: Option<String>,
    pub location: Option<String>,
    pub state: Option<DeviceState>,
    pub owner_id: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
}

// ─── Device queries ──────────────────────────────────────────────────────────

pub async fn list_devices(pool: &SqlitePool, filter: &DeviceFilter) -> sqlx::Result<Vec<Device>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM devices WHERE 1 = 1");

    if !filter.include_inactive {
        qb.push(" AND active = 1");
    }
    if let Some(name) = filter.name.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND LOWER(name) LIKE ")
            .push_bind(format!("%{}%", name.to_lowercase()));
    }
    if let Some(location) = filter.location.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND LOWER(location) LIKE ")
            .push_bind(format!("%{}%", location.to_lowercase()));
    }
    if let Some(state) = filter.state {
        qb.push(" AND state = ").push_bind(state);
    }
    if let Some(owner) = filter.owner_id.as_deref() {
        qb.push(" AND owner_id = ").push_bind(owner.to_string());
    }
    qb.push(" ORDER BY registered_at DESC");

    qb.build_query_as::<Device>().fetch_all(pool).await
}

pub async fn get_device(pool: &SqlitePool, id: &str) -> sqlx::Result<Option<Device>> {
    sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_device_by_key(pool: &SqlitePool, device_key: &str) -> sqlx::Result<Option<Device>> {
    sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE device_key = ?")
        .bind(device_key)
        .fetch_optional(pool)
        .await
}

pub async fn mac_exists(pool: &SqlitePool, mac: &str) -> sqlx::Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices WHERE mac = ?")
        .bind(mac)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

pub async fn insert_device(pool: &SqlitePool, d: &Device) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO devices (id, device_key, name, mac, address, location, description, state, last_heartbeat, registered_at, updated_at, software_version, resolution, orientation, volume, brightness, owner_id, active, offline_notified, version)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&d.id)
    .bind(&d.device_key)
    .bind(&d.name)
    .bind(&d.mac)
    .bind(&d.address)
    .bind(&d.location)
    .bind(&d.description)
    .bind(d.state)
    .bind(d.last_heartbeat)
    .bind(d.registered_at)
    .bind(d.updated_at)
    .bind(&d.software_version)
    .bind(&d.resolution)
    .bind(d.orientation)
    .bind(d.volume)
    .bind(d.brightness)
    .bind(&d.owner_id)
    .bind(d.active)
    .bind(d.offline_notified)
    .bind(d.version)
    .execute(pool)
    .await?;
    Ok(())
}

/// Compare-and-set write of every mutable column. Returns `false` when the row
/// was changed by someone else since `d` was read (its `version` moved on).
pub async fn save_device(pool: &SqlitePool, d: &Device) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE devices SET
           name = ?, address = ?, location = ?, description = ?, state = ?, last_heartbeat = ?,
           updated_at = ?, software_version = ?, resolution = ?, orientation = ?, volume = ?,
           brightness = ?, owner_id = ?, active = ?, offline_notified = ?, version = version + 1
         WHERE id = ? AND version = ?",
    )
    .bind(&d.name)
    .bind(&d.address)
    .bind(&d.location)
    .bind(&d.description)
    .bind(d.state)
    .bind(d.last_heartbeat)
    .bind(d.updated_at)
    .bind(&d.software_version)
    .bind(&d.resolution)
    .bind(d.orientation)
    .bind(d.volume)
    .bind(d.brightness)
    .bind(&d.owner_id)
    .bind(d.active)
    .bind(d.offline_notified)
    .bind(&d.id)
    .bind(d.version)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Active devices currently cached in one of `states`.
pub async fn list_devices_in_states(
    pool: &SqlitePool,
    states: &[DeviceState],
) -> sqlx::Result<Vec<Device>> {
    if states.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT * FROM devices WHERE active = 1 AND state IN (");
    let mut separated = qb.separated(", ");
    for state in states {
        separated.push_bind(*state);
    }
    separated.push_unseparated(")");

    qb.build_query_as::<Device>().fetch_all(pool).await
}

pub async fn count_devices_by_state(pool: &SqlitePool) -> sqlx::Result<Vec<(DeviceState, i64)>> {
    sqlx::query_as::<_, (DeviceState, i64)>(
        "SELECT state, COUNT(*) FROM devices WHERE active = 1 GROUP BY state",
    )
    .fetch_all(pool)
    .await
}

/// Active devices not running `version` (including ones that never reported one).
pub async fn list_outdated_devices(pool: &SqlitePool, version: &str) -> sqlx::Result<Vec<Device>> {
    sqlx::query_as::<_, Device>(
        "SELECT * FROM devices
         WHERE active = 1 AND (software_version IS NULL OR software_version != ?)
         ORDER BY name",
    )
    .bind(version)
    .fetch_all(pool)
    .await
}
