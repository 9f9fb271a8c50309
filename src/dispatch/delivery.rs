use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};

use super::command::Command;

/// Outbound messages on a device's push channel
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    Command { command: Command },
    /// Best-effort request to drop a command the device already received
    Cancel { command_id: String },
}

/// Per-device outbound buffer. A device that falls this far behind is served
/// by the pull path until it drains.
const CHANNEL_CAPACITY: usize = 32;

struct Connection {
    generation: u64,
    tx: mpsc::Sender<PushMessage>,
}

/// Open push channels, at most one per device. A reconnect replaces the
/// previous connection; the stale socket task then finds its generation gone.
#[derive(Default)]
pub struct ChannelRegistry {
    next_generation: AtomicU64,
    connections: RwLock<HashMap<String, Connection>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, device_id: &str) -> (u64, mpsc::Receiver<PushMessage>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let previous = self
            .connections
            .write()
            .await
            .insert(device_id.to_string(), Connection { generation, tx });
        if previous.is_some() {
            tracing::info!(device = %device_id, "Push channel replaced by a newer connection");
        }
        (generation, rx)
    }

    /// Remove the connection only if it is still the one opened as `generation`.
    pub async fn disconnect(&self, device_id: &str, generation: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(device_id) {
            Some(conn) if conn.generation == generation => {
                connections.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(device_id)
            .map(|c| !c.tx.is_closed())
            .unwrap_or(false)
    }

    /// Pick the delivery backend for a device based on channel availability.
    pub async fn route(&self, device_id: &str) -> DeliveryRoute {
        match self.connections.read().await.get(device_id) {
            Some(conn) if !conn.tx.is_closed() => DeliveryRoute::Push(conn.tx.clone()),
            _ => DeliveryRoute::Pull,
        }
    }
}

pub enum DeliveryRoute {
    Push(mpsc::Sender<PushMessage>),
    /// The device fetches outstanding commands when it polls
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Pushed,
    Deferred,
}

impl DeliveryRoute {
    /// Never blocks. A full or closed push channel is a transient network
    /// failure: logged, and the message stays on the pull path.
    pub fn deliver(&self, device_id: &str, message: PushMessage) -> Delivery {
        match self {
            DeliveryRoute::Push(tx) => match tx.try_send(message) {
                Ok(()) => Delivery::Pushed,
                Err(e) => {
                    tracing::debug!(device = %device_id, error = %e, "Push delivery failed, falling back to pull");
                    Delivery::Deferred
                }
            },
            DeliveryRoute::Pull => Delivery::Deferred,
        }
    }
}
