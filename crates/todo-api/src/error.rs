use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::TodoError;
use thiserror::Error;
use tracing::error;

/// HTTP 層のエラー。本文は `{"error": "<message>"}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Todo(#[from] TodoError),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Todo(TodoError::NotAuthenticated) | ApiError::Unauthorized(_) => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Todo(TodoError::AlreadyShared(_)) => StatusCode::CONFLICT,
            ApiError::Todo(TodoError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Todo(TodoError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Todo(TodoError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Todo(TodoError::Store(e)) => {
                error!(error = %e, "Store operation failed");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
