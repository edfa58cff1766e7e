use crate::{
    repos::RegistryError,
    services::{blob_backend::BackendError, finalizer::FinalizeError},
};
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

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, msg)
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
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        AppError::internal(err.to_string())
    }
}

/// Finalization failures surface as the outcome of the client's request even
/// when the backend already stored the bytes.
impl From<FinalizeError> for AppError {
    fn from(err: FinalizeError) -> Self {
        let message = err.to_string();
        match err {
            FinalizeError::ConflictingState { .. } => AppError::conflict(message),
            FinalizeError::ProjectNotFound(_) | FinalizeError::BlobUnknown(_) => {
                AppError::not_found(message)
            }
            FinalizeError::LookupFailed(_)
            | FinalizeError::SizeUnresolved { .. }
            | FinalizeError::DigestMissing
            | FinalizeError::EnsureFailed { .. }
            | FinalizeError::AssociateFailed { .. }
            | FinalizeError::Transaction(_) => AppError::internal(message),
        }
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        let message = err.to_string();
        match err {
            BackendError::UploadUnknown(_) | BackendError::BlobUnknown(_) => {
                AppError::not_found(message)
            }
            BackendError::DigestInvalid(_) | BackendError::DigestMismatch { .. } => {
                AppError::bad_request(message)
            }
            BackendError::Sqlx(_) | BackendError::Io(_) => AppError::internal(message),
        }
    }
}
