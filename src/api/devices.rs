use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    auth::Principal,
    db::{models::Device, queries::DeviceFilter},
    error::FleetResult,
    registry::{AdminState, DeviceUpdate, NewDevice},
    AppState,
};

/// A device with liveness derived from its heartbeat, never from the stored state alone
#[derive(Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: Device,
    pub online: bool,
}

fn view(state: &AppState, device: Device) -> DeviceView {
    DeviceView {
        online: state.presence.is_online(&device),
        device,
    }
}

#[derive(Deserialize)]
pub struct SetStateRequest {
    pub state: AdminState,
}

/// GET /api/devices
pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<DeviceFilter>,
) -> FleetResult<impl IntoResponse> {
    let devices: Vec<DeviceView> = state
        .registry
        .list(&filter)
        .await?
        .into_iter()
        .map(|d| view(&state, d))
        .collect();
    Ok(Json(serde_json::json!({ "devices": devices })))
}

/// GET /api/devices/:id
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> FleetResult<impl IntoResponse> {
    let device = state.registry.get(&id).await?;
    Ok(Json(view(&state, device)))
}

/// POST /api/devices
pub async fn add_device(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<NewDevice>,
) -> FleetResult<impl IntoResponse> {
    let device = state.registry.register(&principal.name, req).await?;
    Ok((StatusCode::CREATED, Json(view(&state, device))))
}

/// PATCH /api/devices/:id
pub async fn update_device(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(req): Json<DeviceUpdate>,
) -> FleetResult<impl IntoResponse> {
    let device = state.registry.update(&principal.name, &id, req).await?;
    Ok(Json(view(&state, device)))
}

/// DELETE /api/devices/:id  (soft delete)
pub async fn delete_device(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> FleetResult<impl IntoResponse> {
    let device = state.registry.deactivate(&principal.name, &id).await?;
    Ok(Json(view(&state, device)))
}

/// POST /api/devices/:id/state
pub async fn set_device_state(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(req): Json<SetStateRequest>,
) -> FleetResult<impl IntoResponse> {
    let device = state
        .registry
        .set_admin_state(&principal.name, &id, req.state)
        .await?;
    Ok(Json(view(&state, device)))
}

/// GET /api/devices/:id/telemetry
pub async fn get_telemetry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> FleetResult<impl IntoResponse> {
    state.registry.get(&id).await?;
    let telemetry = state.telemetry.snapshot(&id).await?;
    Ok(Json(telemetry))
}
