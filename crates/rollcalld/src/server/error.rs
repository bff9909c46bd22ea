use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rollcall_gallery::{EnrollmentError, GalleryError, StoreError};
use serde_json::json;

use crate::attendance::AttendanceError;
use crate::engine::EngineError;

pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// API error, rendered as `{"success": false, "code", "message"}`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!(error = %err, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "code": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Enrollment(e) => e.into(),
            EngineError::Gallery(GalleryError::UnknownIdentity(label)) => Self::new(
                StatusCode::NOT_FOUND,
                "unknown_identity",
                format!("no enrolled identity named {label}"),
            ),
            EngineError::Gallery(GalleryError::Store(err @ StoreError::InvalidIdentity { .. })) => {
                Self::bad_request("invalid_identity", err.to_string())
            }
            EngineError::ChannelClosed => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "recognition service unavailable",
            ),
            other => Self::internal(other),
        }
    }
}

impl From<EnrollmentError> for AppError {
    fn from(err: EnrollmentError) -> Self {
        if matches!(err, EnrollmentError::Storage(_)) {
            return Self::internal(err);
        }
        let status = if matches!(err, EnrollmentError::DuplicateLabel(_)) {
            StatusCode::CONFLICT
        } else {
            StatusCode::UNPROCESSABLE_ENTITY
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<AttendanceError> for AppError {
    fn from(err: AttendanceError) -> Self {
        Self::internal(err)
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal(err)
    }
}
