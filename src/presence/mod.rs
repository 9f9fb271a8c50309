//! Presence tracking
//!
//! The last-heartbeat timestamp is the only source of truth for liveness. The
//! stored `DeviceState` is a cache of it: `is_online` always re-derives from the
//! timestamp, and the sweep brings the cache back in line when it drifts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::config::PresenceConfig;
use crate::db::models::{Device, DeviceState};
use crate::error::FleetResult;
use crate::notify::{Notifier, OfflineAlert};
use crate::registry::DeviceRegistry;
use crate::telemetry::{SysInfo, TelemetryAggregator};
use crate::ws::WsEvent;

/// Pure liveness check: a live cached state backed by a fresh heartbeat.
pub fn is_online(device: &Device, now: DateTime<Utc>, staleness: Duration) -> bool {
    device.active
        && device.state.is_live()
        && device
            .last_heartbeat
            .map(|seen| now - seen < staleness)
            .unwrap_or(false)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Heartbeat {
    #[serde(alias = "deviceKey")]
    pub device_key: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub sysinfo: Option<SysInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatAck {
    pub device_id: String,
    pub state: DeviceState,
    pub server_time: DateTime<Utc>,
    /// Seconds until the device should report again to stay online
    pub staleness_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PresenceSweep {
    pub disconnected: usize,
    pub alerted: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub total: i64,
    pub online: usize,
    pub by_state: BTreeMap<&'static str, i64>,
}

pub struct PresenceTracker {
    registry: Arc<DeviceRegistry>,
    telemetry: Arc<TelemetryAggregator>,
    notifier: Arc<dyn Notifier>,
    event_tx: broadcast::Sender<WsEvent>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        telemetry: Arc<TelemetryAggregator>,
        notifier: Arc<dyn Notifier>,
        event_tx: broadcast::Sender<WsEvent>,
        clock: Arc<dyn Clock>,
        config: PresenceConfig,
    ) -> Self {
        PresenceTracker {
            registry,
            telemetry,
            notifier,
            event_tx,
            clock,
            config,
        }
    }

    /// `is_online` against the configured threshold and current time.
    pub fn is_online(&self, device: &Device) -> bool {
        is_online(device, self.clock.now(), self.config.staleness())
    }

    pub async fn record_heartbeat(&self, hb: Heartbeat) -> FleetResult<HeartbeatAck> {
        let device = self.registry.get_by_key(hb.device_key.trim()).await?;
        let now = self.clock.now();

        let (before, after) = self
            .registry
            .update_with(&device.id, |d| {
                d.last_heartbeat = Some(now);
                d.offline_notified = false;
                if let Some(address) = hb.address.as_ref().filter(|a| !a.is_empty()) {
                    d.address = Some(address.clone());
                }
                if let Some(version) = hb.version.as_ref().filter(|v| !v.is_empty()) {
                    d.software_version = Some(version.clone());
                }
                // Error/Maintenance are left only by an operator
                if matches!(d.state, DeviceState::Pending | DeviceState::Disconnected) {
                    d.state = DeviceState::Connected;
                }
                Ok(true)
            })
            .await?;

        if before.state != after.state {
            tracing::info!(device = %after.id, key = %after.device_key, "Device came online");
        } else {
            tracing::debug!(device = %after.id, "Heartbeat");
        }

        if let Some(info) = &hb.sysinfo {
            // Samples are best-effort; a failed insert must not fail the heartbeat
            if let Err(e) = self.telemetry.record_sample(&after.id, info).await {
                tracing::warn!(device = %after.id, error = %e, "Failed to record resource sample");
            }
        }

        Ok(HeartbeatAck {
            device_id: after.id,
            state: after.state,
            server_time: now,
            staleness_secs: self.config.staleness_secs,
        })
    }

    /// Move every stale live device to `Disconnected`, then notify once for each
    /// device that has stayed disconnected past the alert threshold. Recomputes
    /// purely from stored state, so an interrupted run is resumed by the next one.
    pub async fn sweep(&self) -> FleetResult<PresenceSweep> {
        let now = self.clock.now();
        let staleness = self.config.staleness();
        let mut report = PresenceSweep::default();

        let live = self
            .registry
            .list_in_states(&[DeviceState::Connected, DeviceState::Playing, DeviceState::Updating])
            .await?;

        for device in live.iter().filter(|d| !is_online(d, now, staleness)) {
            let result = self
                .registry
                .update_with(&device.id, |d| {
                    // Re-check against the fresh row: a heartbeat may have landed meanwhile
                    if !d.state.is_live() || is_online(d, now, staleness) {
                        return Ok(false);
                    }
                    d.state = DeviceState::Disconnected;
                    Ok(true)
                })
                .await;
            match result {
                Ok((before, after)) if before.state != after.state => {
                    tracing::info!(
                        device = %device.id,
                        last_heartbeat = ?after.last_heartbeat,
                        "Device went offline"
                    );
                    report.disconnected += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(device = %device.id, error = %e, "Presence sweep failed for device");
                    report.errors += 1;
                }
            }
        }

        let alert_after = self.config.offline_alert_after();
        let disconnected = self.registry.list_in_states(&[DeviceState::Disconnected]).await?;
        for device in disconnected.iter().filter(|d| !d.offline_notified) {
            let Some(seen) = device.last_heartbeat else {
                continue;
            };
            if now - seen < alert_after {
                continue;
            }
            let result = self
                .registry
                .update_with(&device.id, |d| {
                    if d.offline_notified || d.state != DeviceState::Disconnected {
                        return Ok(false);
                    }
                    d.offline_notified = true;
                    Ok(true)
                })
                .await;
            match result {
                Ok((before, after)) if !before.offline_notified && after.offline_notified => {
                    let offline_for_secs = (now - seen).num_seconds();
                    self.notifier.device_offline(OfflineAlert {
                        device_id: after.id.clone(),
                        name: after.name.clone(),
                        location: after.location.clone(),
                        last_heartbeat: after.last_heartbeat,
                        offline_for_secs,
                    });
                    let _ = self.event_tx.send(WsEvent::DeviceOffline {
                        device_id: after.id,
                        name: after.name,
                        offline_for_secs,
                    });
                    report.alerted += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(device = %device.id, error = %e, "Offline alert failed for device");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Counts per cached state plus the online count derived from timestamps.
    pub async fn summary(&self) -> FleetResult<FleetSummary> {
        let mut by_state: BTreeMap<&'static str, i64> =
            DeviceState::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        for (state, count) in self.registry.count_by_state().await? {
            by_state.insert(state.as_str(), count);
        }
        let live = self
            .registry
            .list_in_states(&[DeviceState::Connected, DeviceState::Playing, DeviceState::Updating])
            .await?;

        Ok(FleetSummary {
            total: by_state.values().sum(),
            online: live.iter().filter(|d| self.is_online(d)).count(),
            by_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;
    use crate::db;
    use crate::notify::MemoryNotifier;
    use crate::registry::{AdminState, NewDevice};

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        presence: PresenceTracker,
        notifier: Arc<MemoryNotifier>,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        let pool = db::open_in_memory().await.unwrap();
        let (event_tx, _) = broadcast::channel(64);
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(DeviceRegistry::new(
            pool.clone(),
            event_tx.clone(),
            Arc::new(MemoryAuditSink::default()),
            clock.clone(),
        ));
        let telemetry = Arc::new(TelemetryAggregator::new(pool, clock.clone(), 10));
        let notifier = Arc::new(MemoryNotifier::default());
        let presence = PresenceTracker::new(
            registry.clone(),
            telemetry,
            notifier.clone(),
            event_tx,
            clock.clone(),
            PresenceConfig {
                staleness_secs: 120,
                sweep_interval_secs: 30,
                offline_alert_after_secs: 600,
            },
        );
        Fixture {
            registry,
            presence,
            notifier,
            clock,
        }
    }

    async fn register(f: &Fixture, key: &str, mac: &str) -> Device {
        f.registry
            .register(
                "ops",
                NewDevice {
                    name: "Screen".into(),
                    mac: mac.into(),
                    device_key: Some(key.into()),
                    address: None,
                    location: None,
                    description: None,
                    resolution: None,
                    orientation: None,
                    volume: None,
                    brightness: None,
                    owner_id: None,
                },
            )
            .await
            .unwrap()
    }

    fn heartbeat(key: &str) -> Heartbeat {
        Heartbeat {
            device_key: key.into(),
            address: Some("10.0.0.12".into()),
            version: Some("2.4.1".into()),
            sysinfo: None,
        }
    }

    #[test]
    fn online_requires_live_state_and_fresh_heartbeat() {
        let now = Utc::now();
        let staleness = Duration::seconds(120);
        let mut device = Device::new("a".into(), "aa:bb:cc:dd:ee:ff".into(), "PI-1".into(), now);

        // Pending with a fresh timestamp is still not online
        device.last_heartbeat = Some(now);
        assert!(!is_online(&device, now, staleness));

        device.state = DeviceState::Connected;
        assert!(is_online(&device, now + Duration::seconds(119), staleness));
        assert!(!is_online(&device, now + Duration::seconds(120), staleness));

        // A stale cache entry never reads as online
        device.last_heartbeat = None;
        assert!(!is_online(&device, now, staleness));
    }

    #[tokio::test]
    async fn heartbeat_connects_and_sweep_disconnects() {
        let f = fixture().await;
        let device = register(&f, "PI-AB12CD34", "aa:bb:cc:dd:ee:ff").await;

        let ack = f.presence.record_heartbeat(heartbeat("PI-AB12CD34")).await.unwrap();
        assert_eq!(ack.state, DeviceState::Connected);
        let stored = f.registry.get(&device.id).await.unwrap();
        assert_eq!(stored.software_version.as_deref(), Some("2.4.1"));
        assert!(f.presence.is_online(&stored));

        // Within the window the sweep leaves it alone
        f.clock.advance(Duration::seconds(60));
        assert_eq!(f.presence.sweep().await.unwrap().disconnected, 0);

        f.clock.advance(Duration::seconds(120));
        let stored = f.registry.get(&device.id).await.unwrap();
        assert!(!f.presence.is_online(&stored), "staleness is derived before any sweep");

        let report = f.presence.sweep().await.unwrap();
        assert_eq!(report.disconnected, 1);
        let stored = f.registry.get(&device.id).await.unwrap();
        assert_eq!(stored.state, DeviceState::Disconnected);

        // Sweeping again is a no-op
        assert_eq!(f.presence.sweep().await.unwrap().disconnected, 0);

        f.presence.record_heartbeat(heartbeat("PI-AB12CD34")).await.unwrap();
        let stored = f.registry.get(&device.id).await.unwrap();
        assert!(f.presence.is_online(&stored));
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let f = fixture().await;
        let err = f.presence.record_heartbeat(heartbeat("PI-NOPE")).await.unwrap_err();
        assert!(matches!(err, crate::error::FleetError::NotFound(_)));
    }

    #[tokio::test]
    async fn maintenance_survives_heartbeats_and_sweeps() {
        let f = fixture().await;
        let device = register(&f, "PI-00000001", "aa:bb:cc:dd:ee:01").await;
        f.presence.record_heartbeat(heartbeat("PI-00000001")).await.unwrap();
        f.registry
            .set_admin_state("ops", &device.id, AdminState::Maintenance)
            .await
            .unwrap();

        let ack = f.presence.record_heartbeat(heartbeat("PI-00000001")).await.unwrap();
        assert_eq!(ack.state, DeviceState::Maintenance);

        f.clock.advance(Duration::minutes(10));
        f.presence.sweep().await.unwrap();
        let stored = f.registry.get(&device.id).await.unwrap();
        assert_eq!(stored.state, DeviceState::Maintenance);
        assert!(!f.presence.is_online(&stored));
    }

    #[tokio::test]
    async fn offline_alert_fires_once_and_rearms_on_heartbeat() {
        let f = fixture().await;
        let device = register(&f, "PI-00000002", "aa:bb:cc:dd:ee:02").await;
        f.presence.record_heartbeat(heartbeat("PI-00000002")).await.unwrap();

        f.clock.advance(Duration::minutes(5));
        f.presence.sweep().await.unwrap();
        assert!(f.notifier.device_ids().is_empty());

        f.clock.advance(Duration::minutes(6));
        assert_eq!(f.presence.sweep().await.unwrap().alerted, 1);
        assert_eq!(f.presence.sweep().await.unwrap().alerted, 0);

        f.presence.record_heartbeat(heartbeat("PI-00000002")).await.unwrap();
        f.clock.advance(Duration::minutes(11));
        f.presence.sweep().await.unwrap();
        assert_eq!(f.notifier.device_ids(), vec![device.id.clone(), device.id]);
    }

    #[tokio::test]
    async fn summary_counts_states_and_online() {
        let f = fixture().await;
        register(&f, "PI-00000003", "aa:bb:cc:dd:ee:03").await;
        register(&f, "PI-00000004", "aa:bb:cc:dd:ee:04").await;
        f.presence.record_heartbeat(heartbeat("PI-00000003")).await.unwrap();

        let summary = f.presence.summary().await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.online, 1);
        assert_eq!(summary.by_state["pending"], 1);
        assert_eq!(summary.by_state["connected"], 1);
    }
}
