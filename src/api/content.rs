use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    auth::Principal,
    content::{NewContent, Schedule},
    error::FleetResult,
    AppState,
};

#[derive(Deserialize)]
pub struct AssignRequest {
    #[serde(alias = "deviceIds")]
    pub device_ids: Vec<String>,
    #[serde(default)]
    pub schedule: Schedule,
}

/// POST /api/content
pub async fn create_content(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<NewContent>,
) -> FleetResult<impl IntoResponse> {
    let asset = state.content.register_asset(&principal.name, req).await?;
    Ok((StatusCode::CREATED, Json(asset)))
}

/// GET /api/content
pub async fn list_content(State(state): State<Arc<AppState>>) -> FleetResult<impl IntoResponse> {
    let assets = state.content.list_assets().await?;
    Ok(Json(serde_json::json!({ "content": assets })))
}

/// GET /api/content/:id
pub async fn get_content(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> FleetResult<impl IntoResponse> {
    Ok(Json(state.content.get_asset(id).await?))
}

/// POST /api/content/:id/assign
pub async fn assign_content(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
    Json(req): Json<AssignRequest>,
) -> FleetResult<impl IntoResponse> {
    let records = state
        .content
        .assign(&principal.name, id, &req.device_ids, req.schedule)
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "records": records }))))
}

/// GET /api/content/:id/sync
pub async fn content_sync(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> FleetResult<impl IntoResponse> {
    let records = state.content.content_status(id).await?;
    Ok(Json(serde_json::json!({ "records": records })))
}

/// GET /api/devices/:id/sync
pub async fn device_sync(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> FleetResult<impl IntoResponse> {
    Ok(Json(state.content.device_summary(&device_id).await?))
}

/// POST /api/content/:id/devices/:device_id/retry
pub async fn retry_sync(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path((id, device_id)): Path<(i64, String)>,
) -> FleetResult<impl IntoResponse> {
    let record = state.content.retry(&principal.name, &device_id, id).await?;
    Ok(Json(record))
}
