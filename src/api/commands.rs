use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::{auth::Principal, dispatch::CommandKind, error::FleetResult, AppState};

#[derive(Deserialize)]
pub struct SubmitCommandRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// POST /api/devices/:id/commands
///
/// Returns as soon as the command is queued; delivery happens out of band.
pub async fn submit_command(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(device_id): Path<String>,
    Json(req): Json<SubmitCommandRequest>,
) -> FleetResult<impl IntoResponse> {
    let kind = CommandKind::from_parts(&req.kind, req.params)?;
    let command = state
        .dispatcher
        .submit(&principal.name, &device_id, kind)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(command)))
}

/// GET /api/devices/:id/commands
pub async fn list_commands(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> FleetResult<impl IntoResponse> {
    let commands = state.dispatcher.history(&device_id, query.limit).await?;
    Ok(Json(serde_json::json!({ "commands": commands })))
}

/// GET /api/commands/:id
pub async fn get_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> FleetResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.get(&id).await?))
}

/// POST /api/commands/:id/cancel
pub async fn cancel_command(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> FleetResult<impl IntoResponse> {
    let outcome = state.dispatcher.cancel(&principal.name, &id).await?;
    Ok(Json(outcome))
}
