use serde::{Deserialize, Serialize};

use crate::db::models::{CommandStatus, DeviceState, SyncStatus};

/// All WebSocket events sent to connected admin clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    /// A device was added to the registry
    DeviceRegistered {
        device_id: String,
        name: String,
        mac: String,
    },
    /// Cached lifecycle state moved
    DeviceStateChanged {
        device_id: String,
        from: DeviceState,
        to: DeviceState,
    },
    /// A device was soft-removed
    DeviceDeactivated { device_id: String },
    /// A device has been disconnected longer than the alert threshold
    DeviceOffline {
        device_id: String,
        name: String,
        offline_for_secs: i64,
    },
    /// A command was created or moved along its lifecycle
    CommandStatusChanged {
        command_id: String,
        device_id: String,
        kind: String,
        status: CommandStatus,
    },
    /// A device reported download progress, or a retry was scheduled
    SyncProgress {
        device_id: String,
        content_id: i64,
        status: SyncStatus,
        progress: i64,
    },
    /// A device opened or closed its push channel
    ChannelStatus { device_id: String, connected: bool },
}

impl WsEvent {
    /// Device the event concerns; every variant names one
    pub fn device_id(&self) -> &str {
        match self {
            WsEvent::DeviceRegistered { device_id, .. }
            | WsEvent::DeviceStateChanged { device_id, .. }
            | WsEvent::DeviceDeactivated { device_id }
            | WsEvent::DeviceOffline { device_id, .. }
            | WsEvent::CommandStatusChanged { device_id, .. }
            | WsEvent::SyncProgress { device_id, .. }
            | WsEvent::ChannelStatus { device_id, .. } => device_id,
        }
    }
}
