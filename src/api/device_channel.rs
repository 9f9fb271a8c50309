use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{
    db::models::{CommandStatus, Device},
    dispatch::AckStatus,
    error::{FleetError, FleetResult},
    presence::{Heartbeat, HeartbeatAck},
    telemetry::SysInfo,
    ws::WsEvent,
    AppState,
};

#[derive(Deserialize)]
pub struct ChannelAuth {
    pub key: String,
}

/// Inbound frames from the device
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DeviceFrame {
    Heartbeat {
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        sysinfo: Option<SysInfo>,
    },
    Ack {
        #[serde(alias = "commandId")]
        command_id: String,
        status: AckStatus,
        #[serde(default)]
        response: Option<Value>,
    },
}

/// Replies to inbound frames; pushes use `PushMessage`
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChannelReply {
    HeartbeatAck {
        #[serde(flatten)]
        ack: HeartbeatAck,
    },
    AckReceived {
        command_id: String,
        status: CommandStatus,
    },
    Error {
        message: String,
    },
}

/// GET /api/devices/:id/channel?key=  (device push channel)
///
/// The key is checked before the upgrade so an unknown device gets a plain
/// HTTP error instead of a socket that closes immediately.
pub async fn channel_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(auth): Query<ChannelAuth>,
) -> FleetResult<impl IntoResponse> {
    let device = state.registry.get_by_key(auth.key.trim()).await?;
    if device.id != id {
        return Err(FleetError::Unauthorized("device key does not match".into()));
    }
    Ok(ws.on_upgrade(move |socket| handle_channel(socket, state, device)))
}

async fn handle_channel(socket: WebSocket, state: Arc<AppState>, device: Device) {
    let (mut sender, mut receiver) = socket.split();
    let (generation, mut push_rx) = state.channels.connect(&device.id).await;
    let (reply_tx, mut reply_rx) = mpsc::channel::<Message>(16);

    tracing::info!(device = %device.id, generation, "Push channel opened");
    let _ = state.event_tx.send(WsEvent::ChannelStatus {
        device_id: device.id.clone(),
        connected: true,
    });

    // Only this task writes to the socket
    let send_task = tokio::spawn(async move {
        loop {
            let outbound = tokio::select! {
                pushed = push_rx.recv() => match pushed {
                    Some(msg) => match serde_json::to_string(&msg) {
                        Ok(text) => Message::Text(text),
                        Err(_) => continue,
                    },
                    // Replaced by a newer connection
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if sender.send(outbound).await.is_err() {
                break;
            }
        }
    });

    // Anything queued while the device was away goes out now
    match state.dispatcher.flush_outstanding(&device.id).await {
        Ok(0) => {}
        Ok(pushed) => tracing::info!(device = %device.id, pushed, "Flushed outstanding commands"),
        Err(e) => tracing::warn!(device = %device.id, error = %e, "Failed to flush outstanding commands"),
    }

    let recv_state = state.clone();
    let recv_device = device.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let reply = match msg {
                Ok(Message::Text(text)) => Some(handle_frame(&recv_state, &recv_device, &text).await),
                Ok(Message::Ping(data)) => Some(Message::Pong(data)),
                Ok(Message::Close(_)) | Err(_) => break,
                _ => None,
            };
            if let Some(reply) = reply {
                if reply_tx.send(reply).await.is_err() {
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    if state.channels.disconnect(&device.id, generation).await {
        let _ = state.event_tx.send(WsEvent::ChannelStatus {
            device_id: device.id.clone(),
            connected: false,
        });
    }
    tracing::info!(device = %device.id, generation, "Push channel closed");
}

async fn handle_frame(state: &AppState, device: &Device, text: &str) -> Message {
    let reply = match serde_json::from_str::<DeviceFrame>(text) {
        Ok(frame) => match apply_frame(state, device, frame).await {
            Ok(reply) => reply,
            Err(e) => ChannelReply::Error { message: e.to_string() },
        },
        Err(e) => ChannelReply::Error {
            message: format!("unreadable frame: {e}"),
        },
    };
    match serde_json::to_string(&reply) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Text(format!(r#"{{"type":"error","message":"{e}"}}"#)),
    }
}

async fn apply_frame(state: &AppState, device: &Device, frame: DeviceFrame) -> FleetResult<ChannelReply> {
    match frame {
        DeviceFrame::Heartbeat { address, version, sysinfo } => {
            let ack = state
                .presence
                .record_heartbeat(Heartbeat {
                    device_key: device.device_key.clone(),
                    address,
                    version,
                    sysinfo,
                })
                .await?;
            Ok(ChannelReply::HeartbeatAck { ack })
        }
        DeviceFrame::Ack { command_id, status, response } => {
            let command = state.dispatcher.get(&command_id).await?;
            if command.device_id != device.id {
                return Err(FleetError::not_found(format!("command {command_id}")));
            }
            let command = state.dispatcher.acknowledge(&command_id, status, response).await?;
            Ok(ChannelReply::AckReceived {
                command_id: command.id,
                status: command.status,
            })
        }
    }
}

