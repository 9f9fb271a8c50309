use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Device ─────────────────────────────────────────────────────────────────

/// Lifecycle state of a device. `Connected`, `Playing` and `Updating` are
/// only a cache of the heartbeat timestamp; see `presence::is_online`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeviceState {
    Pending,
    Connected,
    Disconnected,
    Error,
    Maintenance,
    Playing,
    Updating,
}

impl DeviceState {
    pub const ALL: [DeviceState; 7] = [
        DeviceState::Pending,
        DeviceState::Connected,
        DeviceState::Disconnected,
        DeviceState::Error,
        DeviceState::Maintenance,
        DeviceState::Playing,
        DeviceState::Updating,
    ];

    /// States that assert the device is reachable right now.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            DeviceState::Connected | DeviceState::Playing | DeviceState::Updating
        )
    }

    /// States only an operator can enter or leave.
    pub fn is_administrative(self) -> bool {
        matches!(self, DeviceState::Error | DeviceState::Maintenance)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Pending => "pending",
            DeviceState::Connected => "connected",
            DeviceState::Disconnected => "disconnected",
            DeviceState::Error => "error",
            DeviceState::Maintenance => "maintenance",
            DeviceState::Playing => "playing",
            DeviceState::Updating => "updating",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Orientation {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub device_key: String,
    pub name: String,
    pub mac: String,
    pub address: Option<String>,
    pub location: String,
    pub description: Option<String>,
    pub state: DeviceState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub software_version: Option<String>,
    pub resolution: Option<String>,
    pub orientation: Orientation,
    pub volume: i64,
    pub brightness: i64,
    pub owner_id: Option<String>,
    pub active: bool,
    #[serde(skip)]
    pub offline_notified: bool,
    /// Optimistic concurrency token, bumped on every write
    #[serde(skip)]
    pub version: i64,
}

impl Device {
    pub fn new(name: String, mac: String, device_key: String, now: DateTime<Utc>) -> Self {
        Device {
            id: Uuid::new_v4().to_string(),
            device_key,
            name,
            mac,
            address: None,
            location: String::new(),
            description: None,
            state: DeviceState::Pending,
            last_heartbeat: None,
            registered_at: now,
            updated_at: now,
            software_version: None,
            resolution: None,
            orientation: Orientation::Horizontal,
            volume: 50,
            brightness: 80,
            owner_id: None,
            active: true,
            offline_notified: false,
            version: 0,
        }
    }
}

// ─── Command ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
    Cancelled,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FailureReason {
    /// No acknowledgement before the delivery deadline
    Timeout,
    /// Needed a live device and never reached it before the delivery deadline
    Undelivered,
    /// The device acknowledged with a failure status
    DeviceReported,
}

/// Raw `commands` row; the typed view lives in `dispatch::Command`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommandRow {
    pub id: String,
    pub device_id: String,
    pub kind: String,
    pub payload: String,
    pub status: CommandStatus,
    pub response: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub issued_by: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_delivered_at: Option<DateTime<Utc>>,
    pub delivery_attempts: i64,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

// ─── Content ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ContentKind {
    Image,
    Video,
    Web,
    Html,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContentAsset {
    pub id: i64,
    pub name: String,
    pub kind: ContentKind,
    pub url: String,
    pub checksum: String,
    pub size_bytes: i64,
    pub duration_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncRecord {
    pub device_id: String,
    pub content_id: i64,
    pub status: SyncStatus,
    pub progress: i64,
    pub bytes_downloaded: i64,
    pub retry_count: i64,
    /// Set while an automatic retry is scheduled; `None` on a failed record means it is permanent
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub schedule_start: Option<DateTime<Utc>>,
    pub schedule_end: Option<DateTime<Utc>>,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub version: i64,
}

impl SyncRecord {
    pub fn is_permanently_failed(&self) -> bool {
        self.status == SyncStatus::Failed && self.next_retry_at.is_none()
    }
}

// ─── Telemetry ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TelemetryRow {
    pub device_id: String,
    pub commands_sent: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub reliability: Option<f64>,
    pub avg_latency_ms: f64,
    pub latency_samples: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResourceSample {
    #[serde(skip)]
    pub id: i64,
    #[serde(skip)]
    pub device_id: String,
    pub recorded_at: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub temperature_c: Option<f64>,
    pub bandwidth_mbps: Option<f64>,
}
