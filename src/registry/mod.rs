use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::clock::Clock;
use crate::db::{
    models::{Device, DeviceState, Orientation},
    queries::{self, DeviceFilter},
};
use crate::error::{FleetError, FleetResult};
use crate::ws::WsEvent;

/// Attempts at a compare-and-set write before giving up with `Conflict`
const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct NewDevice {
    pub name: String,
    pub mac: String,
    #[serde(default, alias = "deviceKey")]
    pub device_key: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub orientation: Option<Orientation>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub brightness: Option<i64>,
    #[serde(default, alias = "ownerId")]
    pub owner_id: Option<String>,
}

/// Admin-editable fields. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub resolution: Option<String>,
    pub orientation: Option<Orientation>,
    pub volume: Option<i64>,
    pub brightness: Option<i64>,
    #[serde(alias = "ownerId")]
    pub owner_id: Option<String>,
}

/// Operator-only state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminState {
    Error,
    Maintenance,
    /// Leave `Error`/`Maintenance`; the next heartbeat reconnects the device
    Restore,
}

/// Identity and configuration store for devices
pub struct DeviceRegistry {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl DeviceRegistry {
    pub fn new(
        pool: SqlitePool,
        event_tx: broadcast::Sender<WsEvent>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        DeviceRegistry {
            pool,
            event_tx,
            audit,
            clock,
        }
    }

    pub async fn register(&self, actor: &str, req: NewDevice) -> FleetResult<Device> {
        let name = validate_name(&req.name)?;
        let mac = normalize_mac(&req.mac)?;

        if queries::mac_exists(&self.pool, &mac).await? {
            return Err(FleetError::conflict(format!("MAC {mac} is already registered")));
        }

        let device_key = match req.device_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => {
                validate_device_key(key)?;
                if queries::get_device_by_key(&self.pool, key).await?.is_some() {
                    return Err(FleetError::conflict(format!("device key {key} is already registered")));
                }
                key.to_string()
            }
            _ => generate_device_key(),
        };

        let mut device = Device::new(name, mac, device_key, self.clock.now());
        device.address = req.address;
        device.location = validate_len("location", req.location.unwrap_or_default(), 200)?;
        device.description = req
            .description
            .map(|d| validate_len("description", d, 500))
            .transpose()?;
        device.resolution = req.resolution;
        if let Some(orientation) = req.orientation {
            device.orientation = orientation;
        }
        if let Some(volume) = req.volume {
            device.volume = validate_level("volume", volume)?;
        }
        if let Some(brightness) = req.brightness {
            device.brightness = validate_level("brightness", brightness)?;
        }
        device.owner_id = req.owner_id;

        // Unique indexes close the race between the existence checks and the insert
        if let Err(e) = queries::insert_device(&self.pool, &device).await {
            if is_unique_violation(&e) {
                return Err(FleetError::conflict(format!("MAC {} is already registered", device.mac)));
            }
            return Err(e.into());
        }

        tracing::info!(device = %device.id, key = %device.device_key, mac = %device.mac, "Device registered");
        self.audit(actor, AuditAction::DeviceRegistered, &device.id, serde_json::json!({
            "name": device.name,
            "mac": device.mac,
            "device_key": device.device_key,
        }));
        let _ = self.event_tx.send(WsEvent::DeviceRegistered {
            device_id: device.id.clone(),
            name: device.name.clone(),
            mac: device.mac.clone(),
        });
        Ok(device)
    }

    pub async fn update(&self, actor: &str, id: &str, req: DeviceUpdate) -> FleetResult<Device> {
        let (_, device) = self
            .update_with(id, |d| {
                if let Some(name) = &req.name {
                    d.name = validate_name(name)?;
                }
                if let Some(address) = &req.address {
                    d.address = Some(address.clone());
                }
                if let Some(location) = &req.location {
                    d.location = validate_len("location", location.clone(), 200)?;
                }
                if let Some(description) = &req.description {
                    d.description = Some(validate_len("description", description.clone(), 500)?);
                }
                if let Some(resolution) = &req.resolution {
                    d.resolution = Some(resolution.clone());
                }
                if let Some(orientation) = req.orientation {
                    d.orientation = orientation;
                }
                if let Some(volume) = req.volume {
                    d.volume = validate_level("volume", volume)?;
                }
                if let Some(brightness) = req.brightness {
                    d.brightness = validate_level("brightness", brightness)?;
                }
                if let Some(owner) = &req.owner_id {
                    d.owner_id = Some(owner.clone());
                }
                Ok(true)
            })
            .await?;

        self.audit(actor, AuditAction::DeviceUpdated, id, serde_json::json!({ "name": device.name }));
        Ok(device)
    }

    /// Any device, including soft-removed ones.
    pub async fn get(&self, id: &str) -> FleetResult<Device> {
        queries::get_device(&self.pool, id)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("device {id}")))
    }

    /// A device that can still take part in the fleet; soft-removed devices read as absent.
    pub async fn get_active(&self, id: &str) -> FleetResult<Device> {
        let device = self.get(id).await?;
        if !device.active {
            return Err(FleetError::not_found(format!("device {id}")));
        }
        Ok(device)
    }

    pub async fn get_by_key(&self, device_key: &str) -> FleetResult<Device> {
        match queries::get_device_by_key(&self.pool, device_key).await? {
            Some(device) if device.active => Ok(device),
            _ => Err(FleetError::not_found(format!("device key {device_key}"))),
        }
    }

    pub async fn list(&self, filter: &DeviceFilter) -> FleetResult<Vec<Device>> {
        Ok(queries::list_devices(&self.pool, filter).await?)
    }

    pub async fn list_in_states(&self, states: &[DeviceState]) -> FleetResult<Vec<Device>> {
        Ok(queries::list_devices_in_states(&self.pool, states).await?)
    }

    pub async fn count_by_state(&self) -> FleetResult<Vec<(DeviceState, i64)>> {
        Ok(queries::count_devices_by_state(&self.pool).await?)
    }

    pub async fn list_outdated(&self, version: &str) -> FleetResult<Vec<Device>> {
        Ok(queries::list_outdated_devices(&self.pool, version).await?)
    }

    /// Soft delete. History keeps referencing the row.
    pub async fn deactivate(&self, actor: &str, id: &str) -> FleetResult<Device> {
        let (before, device) = self
            .update_with(id, |d| {
                if !d.active {
                    return Ok(false);
                }
                d.active = false;
                Ok(true)
            })
            .await?;

        if before.active {
            tracing::info!(device = %id, "Device deactivated");
            self.audit(actor, AuditAction::DeviceDeactivated, id, serde_json::Value::Null);
            let _ = self.event_tx.send(WsEvent::DeviceDeactivated {
                device_id: id.to_string(),
            });
        }
        Ok(device)
    }

    pub async fn set_admin_state(&self, actor: &str, id: &str, target: AdminState) -> FleetResult<Device> {
        let (before, device) = self
            .update_with(id, |d| {
                let next = match target {
                    AdminState::Error => DeviceState::Error,
                    AdminState::Maintenance => DeviceState::Maintenance,
                    AdminState::Restore if d.state.is_administrative() => DeviceState::Disconnected,
                    AdminState::Restore => {
                        return Err(FleetError::conflict(format!(
                            "device is {}, only error or maintenance can be restored",
                            d.state.as_str()
                        )))
                    }
                };
                if d.state == next {
                    return Ok(false);
                }
                d.state = next;
                Ok(true)
            })
            .await?;

        self.audit(actor, AuditAction::DeviceStateSet, id, serde_json::json!({
            "from": before.state,
            "to": device.state,
        }));
        Ok(device)
    }

    /// Read-modify-write under optimistic concurrency. `apply` returns `false`
    /// when there is nothing to write; it may run more than once if another
    /// writer wins the race, so it must only depend on the device it is given.
    /// Returns the device as read and as written.
    pub async fn update_with<F>(&self, id: &str, mut apply: F) -> FleetResult<(Device, Device)>
    where
        F: FnMut(&mut Device) -> FleetResult<bool>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let before = self.get(id).await?;
            let mut after = before.clone();
            if !apply(&mut after)? {
                return Ok((before, after));
            }
            after.updated_at = self.clock.now();

            if queries::save_device(&self.pool, &after).await? {
                after.version += 1;
                if before.state != after.state {
                    tracing::info!(
                        device = %id,
                        from = before.state.as_str(),
                        to = after.state.as_str(),
                        "Device state changed"
                    );
                    let _ = self.event_tx.send(WsEvent::DeviceStateChanged {
                        device_id: id.to_string(),
                        from: before.state,
                        to: after.state,
                    });
                }
                return Ok((before, after));
            }
            tracing::debug!(device = %id, "Concurrent device write, retrying");
        }
        Err(FleetError::conflict(format!("device {id} is being modified concurrently")))
    }

    fn audit(&self, actor: &str, action: AuditAction, device_id: &str, detail: serde_json::Value) {
        self.audit.record(AuditEvent {
            actor: actor.to_string(),
            action,
            device_id: Some(device_id.to_string()),
            detail,
            at: self.clock.now(),
        });
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Accepts `aa:bb:cc:dd:ee:ff` or `AA-BB-CC-DD-EE-FF`; stores lower-case, colon separated.
pub fn normalize_mac(raw: &str) -> FleetResult<String> {
    let trimmed = raw.trim();
    let sep = if trimmed.contains('-') { '-' } else { ':' };
    let parts: Vec<&str> = trimmed.split(sep).collect();
    let well_formed = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
    if !well_formed {
        return Err(FleetError::validation(format!("invalid MAC address: {raw}")));
    }
    Ok(parts.join(":").to_ascii_lowercase())
}

fn generate_device_key() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("PI-{}", hex[..8].to_ascii_uppercase())
}

fn validate_device_key(key: &str) -> FleetResult<()> {
    let valid = (3..=64).contains(&key.len())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(FleetError::validation(format!("invalid device key: {key}")))
    }
}

fn validate_name(name: &str) -> FleetResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(FleetError::validation("name must not be empty"));
    }
    validate_len("name", name.to_string(), 100)
}

fn validate_len(field: &str, value: String, max: usize) -> FleetResult<String> {
    if value.chars().count() > max {
        return Err(FleetError::validation(format!("{field} exceeds {max} characters")));
    }
    Ok(value)
}

pub(crate) fn validate_level(field: &str, value: i64) -> FleetResult<i64> {
    if !(0..=100).contains(&value) {
        return Err(FleetError::validation(format!("{field} must be between 0 and 100")));
    }
    Ok(value)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;
    use crate::db;

    async fn registry() -> (DeviceRegistry, Arc<MemoryAuditSink>, broadcast::Receiver<WsEvent>) {
        let pool = db::open_in_memory().await.unwrap();
        let (event_tx, event_rx) = broadcast::channel(64);
        let audit = Arc::new(MemoryAuditSink::default());
        let clock = Arc::new(ManualClock::new());
        (DeviceRegistry::new(pool, event_tx, audit.clone(), clock), audit, event_rx)
    }

    fn new_device(name: &str, mac: &str) -> NewDevice {
        NewDevice {
            name: name.to_string(),
            mac: mac.to_string(),
            device_key: None,
            address: None,
            location: Some("Main hall".to_string()),
            description: None,
            resolution: None,
            orientation: None,
            volume: None,
            brightness: None,
            owner_id: None,
        }
    }

    #[test]
    fn mac_is_validated_and_normalized() {
        assert_eq!(normalize_mac("AA-BB-CC-DD-EE-FF").unwrap(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(normalize_mac(" aa:bb:cc:dd:ee:0f ").unwrap(), "aa:bb:cc:dd:ee:0f");
        assert!(normalize_mac("aa:bb:cc:dd:ee").is_err());
        assert!(normalize_mac("aa:bb:cc:dd:ee:gg").is_err());
        assert!(normalize_mac("aa:bb-cc:dd:ee:ff").is_err());
    }

    #[test]
    fn generated_key_has_fleet_prefix() {
        let key = generate_device_key();
        assert_eq!(key.len(), 11);
        assert!(key.starts_with("PI-"));
        assert!(key[3..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn registration_starts_pending_and_rejects_duplicate_mac() {
        let (registry, audit, mut events) = registry().await;

        let device = registry
            .register("ops", new_device("Lobby", "aa:bb:cc:dd:ee:ff"))
            .await
            .unwrap();
        assert_eq!(device.state, DeviceState::Pending);
        assert!(device.active);
        assert!(matches!(events.try_recv(), Ok(WsEvent::DeviceRegistered { .. })));

        // Same MAC in another spelling
        let err = registry
            .register("ops", new_device("Lobby 2", "AA-BB-CC-DD-EE-FF"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
        assert_eq!(audit.actions(), vec![AuditAction::DeviceRegistered]);
    }

    #[tokio::test]
    async fn supplied_device_key_must_be_unique() {
        let (registry, _, _) = registry().await;
        let mut req = new_device("A", "aa:bb:cc:dd:ee:01");
        req.device_key = Some("PI-AB12CD34".into());
        let device = registry.register("ops", req).await.unwrap();
        assert_eq!(device.device_key, "PI-AB12CD34");

        let mut dup = new_device("B", "aa:bb:cc:dd:ee:02");
        dup.device_key = Some("PI-AB12CD34".into());
        assert!(matches!(registry.register("ops", dup).await, Err(FleetError::Conflict(_))));
    }

    #[tokio::test]
    async fn stale_device_write_is_refused() {
        let (registry, _, _) = registry().await;
        let device = registry
            .register("ops", new_device("Lobby", "aa:bb:cc:dd:ee:10"))
            .await
            .unwrap();

        let mut first = device.clone();
        first.name = "Lobby east".into();
        assert!(queries::save_device(&registry.pool, &first).await.unwrap());

        // Same starting version: lost the race
        let mut second = device.clone();
        second.name = "Lobby west".into();
        assert!(!queries::save_device(&registry.pool, &second).await.unwrap());

        let stored = registry.get(&device.id).await.unwrap();
        assert_eq!(stored.name, "Lobby east");
        assert_eq!(stored.version, device.version + 1);
    }

    #[tokio::test]
    async fn concurrent_heartbeat_and_edit_both_land() {
        let h = crate::testing::Harness::new().await;
        let device = h.register("PI-00000010", "aa:bb:cc:dd:ee:10").await;
        let edit = DeviceUpdate {
            location: Some("Food court".into()),
            volume: Some(40),
            ..Default::default()
        };

        let (_, updated) = tokio::join!(
            h.heartbeat("PI-00000010"),
            h.state.registry.update("ops", &device.id, edit)
        );
        updated.unwrap();

        let stored = h.state.registry.get(&device.id).await.unwrap();
        assert_eq!(stored.location, "Food court");
        assert_eq!(stored.volume, 40);
        assert_eq!(stored.state, DeviceState::Connected);
        assert!(stored.last_heartbeat.is_some());
        assert_eq!(stored.software_version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn update_unknown_device_is_not_found() {
        let (registry, _, _) = registry().await;
        let err = registry
            .update("ops", "missing", DeviceUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_validates_and_persists_fields() {
        let (registry, _, _) = registry().await;
        let device = registry
            .register("ops", new_device("Lobby", "aa:bb:cc:dd:ee:ff"))
            .await
            .unwrap();

        let bad = DeviceUpdate {
            volume: Some(101),
            ..Default::default()
        };
        assert!(matches!(
            registry.update("ops", &device.id, bad).await,
            Err(FleetError::Validation(_))
        ));

        let good = DeviceUpdate {
            name: Some("Lobby East".into()),
            brightness: Some(40),
            orientation: Some(Orientation::Vertical),
            ..Default::default()
        };
        let updated = registry.update("ops", &device.id, good).await.unwrap();
        assert_eq!(updated.name, "Lobby East");
        assert_eq!(updated.brightness, 40);
        assert_eq!(updated.orientation, Orientation::Vertical);
        assert_eq!(registry.get(&device.id).await.unwrap().version, updated.version);
    }

    #[tokio::test]
    async fn list_filters_by_substring_and_hides_inactive() {
        let (registry, _, _) = registry().await;
        let lobby = registry
            .register("ops", new_device("Lobby Screen", "aa:bb:cc:dd:ee:01"))
            .await
            .unwrap();
        registry
            .register("ops", new_device("Cafeteria", "aa:bb:cc:dd:ee:02"))
            .await
            .unwrap();

        let filter = DeviceFilter {
            name: Some("lobby".into()),
            ..Default::default()
        };
        let found = registry.list(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, lobby.id);

        registry.deactivate("ops", &lobby.id).await.unwrap();
        assert!(registry.list(&filter).await.unwrap().is_empty());

        let with_inactive = DeviceFilter {
            include_inactive: true,
            ..filter
        };
        assert_eq!(registry.list(&with_inactive).await.unwrap().len(), 1);
        assert!(matches!(registry.get_active(&lobby.id).await, Err(FleetError::NotFound(_))));
    }

    #[tokio::test]
    async fn admin_states_enter_from_anywhere_and_restore_to_disconnected() {
        let (registry, _, _) = registry().await;
        let device = registry
            .register("ops", new_device("Lobby", "aa:bb:cc:dd:ee:ff"))
            .await
            .unwrap();

        assert!(matches!(
            registry.set_admin_state("ops", &device.id, AdminState::Restore).await,
            Err(FleetError::Conflict(_))
        ));

        let device = registry
            .set_admin_state("ops", &device.id, AdminState::Maintenance)
            .await
            .unwrap();
        assert_eq!(device.state, DeviceState::Maintenance);

        let device = registry
            .set_admin_state("ops", &device.id, AdminState::Restore)
            .await
            .unwrap();
        assert_eq!(device.state, DeviceState::Disconnected);
    }
}
