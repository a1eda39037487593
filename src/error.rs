//! Crate-wide error type.
//!
//! Every component boundary returns `Result<T, Error>`. Handlers at the HTTP
//! boundary convert an `Error` into a JSON body via `IntoResponse` rather than
//! each route hand-rolling its own status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input: empty label, relative mount path, unknown serial, in-use
    /// mount path, GUID collision.
    #[error("{0}")]
    Validation(String),

    /// Non-zero exit from a spawned tool, or a spawn failure.
    #[error("command failed: {command}: {output}")]
    SystemCommand { command: String, output: String },

    /// Missing or unreadable `/proc`/`/sys` path. Callers degrade rather than
    /// propagate this in most read paths; it is surfaced when no degraded
    /// value is sensible (e.g. a required fallback also failed).
    #[error("could not read {path}: {reason}")]
    FilesystemRead { path: String, reason: String },

    /// The on-disk metadata file could not be parsed; it has been quarantined
    /// and a fresh empty collection takes its place.
    #[error("metadata file corrupt, quarantined as {quarantine_path}")]
    MetadataCorruption { quarantine_path: String },

    /// A mutating operation is already in flight for this pool GUID.
    #[error("operation already in progress for pool {pool_group_guid}")]
    Conflict { pool_group_guid: String },

    /// No record/operation/drive found for the given identifier.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// How a caller should react to an error: retry on its own schedule, or
/// surface it to the user immediately. Mirrors the retry/no-retry split used
/// by the reconciler and registry background loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    RetryLater,
    NoRetry,
}

impl Error {
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::FilesystemRead { .. } => ErrorAction::RetryLater,
            Error::Validation(_)
            | Error::SystemCommand { .. }
            | Error::MetadataCorruption { .. }
            | Error::Conflict { .. }
            | Error::NotFound(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Internal(_) => ErrorAction::NoRetry,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.action() == ErrorAction::RetryLater
    }

    /// The taxonomy tag carried in API error bodies, independent of the HTTP
    /// status code the error collapses to.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::SystemCommand { .. } => "system_command",
            Error::FilesystemRead { .. } => "filesystem_read",
            Error::MetadataCorruption { .. } => "metadata_corruption",
            Error::Conflict { .. } => "conflict",
            Error::NotFound(_) => "not_found",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::SystemCommand { .. }
            | Error::FilesystemRead { .. }
            | Error::MetadataCorruption { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ApiErrorResponse {
            success: false,
            error: self.kind().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_is_not_retryable() {
        let err = Error::Validation("empty label".into());
        assert_eq!(err.action(), ErrorAction::NoRetry);
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn filesystem_read_is_retryable() {
        let err = Error::FilesystemRead {
            path: "/proc/mdstat".into(),
            reason: "permission denied".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn conflict_maps_to_409() {
        let err = Error::Conflict {
            pool_group_guid: "abc".into(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.kind(), "conflict");
    }
}
