//! HTTP-facing error type.
//!
//! Every failure is rendered as `{"ok": false, "error": "<code>"}` so browser
//! clients can branch on a stable code.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Request body could not be understood
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::BadRequest(detail) => tracing::debug!("Rejecting request: {}", detail),
            AppError::Internal(detail) => tracing::error!("Request failed: {}", detail),
        }
        (self.status(), Json(json!({ "ok": false, "error": self.code() }))).into_response()
    }
}
