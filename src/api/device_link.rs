use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::{
    content::SyncReport,
    dispatch::AckStatus,
    error::FleetResult,
    presence::Heartbeat,
    AppState,
};

// Endpoints called by the players themselves. They identify by device key or
// id and are not behind admin auth.

#[derive(Deserialize)]
pub struct DeviceQuery {
    #[serde(alias = "deviceId")]
    pub device_id: String,
}

#[derive(Deserialize)]
pub struct AckRequest {
    pub status: AckStatus,
    #[serde(default)]
    pub response: Option<Value>,
}

/// POST /api/heartbeat
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(hb): Json<Heartbeat>,
) -> FleetResult<impl IntoResponse> {
    Ok(Json(state.presence.record_heartbeat(hb).await?))
}

/// GET /api/commands/pending?deviceId=
pub async fn pending_commands(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeviceQuery>,
) -> FleetResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.pending_for(&query.device_id).await?))
}

/// POST /api/commands/:id/ack
pub async fn ack_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AckRequest>,
) -> FleetResult<impl IntoResponse> {
    let command = state
        .dispatcher
        .acknowledge(&id, req.status, req.response)
        .await?;
    Ok(Json(command))
}

/// GET /api/content/manifest?deviceId=
pub async fn manifest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeviceQuery>,
) -> FleetResult<impl IntoResponse> {
    Ok(Json(state.content.manifest(&query.device_id).await?))
}

/// POST /api/content/sync-status
pub async fn sync_status(
    State(state): State<Arc<AppState>>,
    Json(report): Json<SyncReport>,
) -> FleetResult<impl IntoResponse> {
    Ok(Json(state.content.report(report).await?))
}
