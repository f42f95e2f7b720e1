use axum::{
    Json,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::{PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::services::error::LakeError;

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

    /// Shortcut for 400 Bad Request
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
        let body = Json(json!({ "detail": self.message }));
        (self.status, body).into_response()
    }
}

impl From<LakeError> for AppError {
    fn from(err: LakeError) -> Self {
        match err {
            LakeError::Validation(err) => AppError::bad_request(err.to_string()),
            LakeError::NotFound(msg) => AppError::not_found(msg),
            LakeError::FolderNotFound(id) => {
                tracing::error!("invariant violated: folder {} vanished mid-request", id);
                AppError::internal(format!("Folder {} referenced but missing.", id))
            }
            other => {
                tracing::error!("request failed: {}", other);
                AppError::internal(other.to_string())
            }
        }
    }
}

/// Extractor rejections keep axum's status and message but use the same
/// `{"detail": ...}` body as every other error.
macro_rules! rejection_into_app_error {
    ($($rejection:ty),+ $(,)?) => {
        $(
            impl From<$rejection> for AppError {
                fn from(rejection: $rejection) -> Self {
                    tracing::debug!("request rejected: {}", rejection.body_text());
                    AppError::new(rejection.status(), rejection.body_text())
                }
            }
        )+
    };
}

rejection_into_app_error!(QueryRejection, PathRejection, MultipartRejection, MultipartError);
