use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::{error::FleetError, error::FleetResult, AppState};

#[derive(Deserialize)]
pub struct OutdatedQuery {
    pub version: String,
}

/// GET /api/fleet/summary
pub async fn summary(State(state): State<Arc<AppState>>) -> FleetResult<impl IntoResponse> {
    Ok(Json(state.presence.summary().await?))
}

/// GET /api/fleet/outdated?version=
pub async fn outdated(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OutdatedQuery>,
) -> FleetResult<impl IntoResponse> {
    let version = query.version.trim();
    if version.is_empty() {
        return Err(FleetError::validation("version must not be empty"));
    }
    let devices = state.registry.list_outdated(version).await?;
    Ok(Json(serde_json::json!({ "version": version, "devices": devices })))
}

/// POST /api/fleet/reconcile  (run a reconciliation pass now)
pub async fn reconcile(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.reconciler.tick().await {
        Some(report) => Json(report).into_response(),
        None => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "reconciliation already running" })),
        )
            .into_response(),
    }
}
