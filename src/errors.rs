use crate::services::{resource_manager::ResourceError, storage::BackendError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), "{}", self.message);
        }

        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<ResourceError> for AppError {
    fn from(err: ResourceError) -> Self {
        let status = match &err {
            ResourceError::ResourceNotFound(_) | ResourceError::VersionNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ResourceError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ResourceError::BackendFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ResourceError::IntegrityViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ResourceError::Validation(_) => StatusCode::BAD_REQUEST,
        };
        AppError::new(status, err.to_string())
    }
}

/// Only the shared-link route talks to the backend directly.
impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(_) => AppError::not_found(err.to_string()),
            BackendError::InvalidLink(_) | BackendError::InvalidKey(_) => {
                AppError::new(StatusCode::FORBIDDEN, err.to_string())
            }
            BackendError::InvalidName(_) => AppError::bad_request(err.to_string()),
            BackendError::AlreadyExists(_) => AppError::new(StatusCode::CONFLICT, err.to_string()),
            BackendError::Io(_) => AppError::internal(err.to_string()),
        }
    }
}
