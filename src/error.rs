use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Errors surfaced by the fleet services and returned to API callers.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    pub fn not_found(what: impl Into<String>) -> Self {
        FleetError::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        FleetError::Conflict(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        FleetError::Validation(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Conflict(_) => StatusCode::CONFLICT,
            FleetError::Validation(_) => StatusCode::BAD_REQUEST,
            FleetError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            FleetError::IntegrityFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FleetError::Database(_) | FleetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
