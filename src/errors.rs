use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::storage::BackendError;

/// The kind of record a [`FilesError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Location,
    Bucket,
    Object,
    Version,
    File,
    Upload,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Location => "location",
            Self::Bucket => "bucket",
            Self::Object => "object",
            Self::Version => "object version",
            Self::File => "file instance",
            Self::Upload => "multipart upload",
        };
        f.write_str(name)
    }
}

/// Errors raised by the storage engine.
#[derive(Debug, Error)]
pub enum FilesError {
    #[error("{kind} `{id}` not found")]
    NotFound { kind: ResourceKind, id: String },
    #[error("integrity conflict: {0}")]
    IntegrityConflict(String),
    #[error("expected {expected} bytes but received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("checksum mismatch for file {file_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file_id: Uuid,
        expected: String,
        actual: String,
    },
    #[error("multipart upload invalid: {0}")]
    MultipartValidation(String),
    #[error("storage backend failure: {0}")]
    StorageBackend(BackendError),
    #[error("requested range not satisfiable for {size} bytes")]
    RangeNotSatisfiable { size: u64 },
    #[error("bucket {bucket_id} quota of {quota} bytes exceeded ({size} bytes)")]
    QuotaExceeded {
        bucket_id: Uuid,
        quota: u64,
        size: u64,
    },
    #[error("file exceeds the maximum size of {limit} bytes")]
    FileTooLarge { limit: u64 },
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("invalid location name `{0}`: lower-case alphanumerics and dashes, at most 20 characters")]
    InvalidLocationName(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("bucket {0} is locked")]
    BucketLocked(Uuid),
    #[error("file {0} is not readable")]
    FileUnreadable(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type FilesResult<T> = Result<T, FilesError>;

impl FilesError {
    pub fn not_found(kind: ResourceKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code for external mapping.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::IntegrityConflict(_) => "IntegrityConflict",
            Self::SizeMismatch { .. } => "SizeMismatch",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::MultipartValidation(_) => "MultipartValidation",
            Self::StorageBackend(_) => "StorageBackend",
            Self::RangeNotSatisfiable { .. } => "RangeNotSatisfiable",
            Self::QuotaExceeded { .. } => "QuotaExceeded",
            Self::FileTooLarge { .. } => "FileTooLarge",
            Self::InvalidKey(_) => "InvalidKey",
            Self::InvalidLocationName(_) => "InvalidLocationName",
            Self::InvalidOperation(_) => "InvalidOperation",
            Self::BucketLocked(_) => "BucketLocked",
            Self::FileUnreadable(_) => "FileUnreadable",
            Self::Sqlx(_) => "InternalError",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::IntegrityConflict(_))
    }
}

impl From<BackendError> for FilesError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::SizeMismatch { expected, actual } => {
                FilesError::SizeMismatch { expected, actual }
            }
            BackendError::LimitExceeded { limit } => FilesError::FileTooLarge { limit },
            other => FilesError::StorageBackend(other),
        }
    }
}

/// Map a write-path database error, turning constraint violations and lost
/// write locks into [`FilesError::IntegrityConflict`].
pub(crate) fn conflict_or_sqlx(err: sqlx::Error, detail: impl FnOnce() -> String) -> FilesError {
    if is_unique_violation(&err) || is_busy(&err) {
        FilesError::IntegrityConflict(detail())
    } else {
        FilesError::Sqlx(err)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// SQLITE_BUSY, SQLITE_LOCKED and SQLITE_BUSY_SNAPSHOT.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("5" | "6" | "517"))
        }
        _ => false,
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            code: "InvalidRequest",
            message: msg.into(),
        }
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
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<FilesError> for AppError {
    fn from(err: FilesError) -> Self {
        let status = match &err {
            FilesError::NotFound { .. } => StatusCode::NOT_FOUND,
            FilesError::IntegrityConflict(_) => StatusCode::CONFLICT,
            FilesError::SizeMismatch { .. }
            | FilesError::MultipartValidation(_)
            | FilesError::FileTooLarge { .. }
            | FilesError::InvalidKey(_)
            | FilesError::InvalidLocationName(_) => StatusCode::BAD_REQUEST,
            FilesError::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            FilesError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            FilesError::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            FilesError::InvalidOperation(_) | FilesError::BucketLocked(_) => {
                StatusCode::FORBIDDEN
            }
            FilesError::FileUnreadable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FilesError::StorageBackend(_) | FilesError::Sqlx(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Backend and database errors carry physical paths; keep them in the logs.
        let message = match &err {
            FilesError::StorageBackend(_) | FilesError::Sqlx(_) => {
                tracing::error!(error = %err, "request failed");
                "internal storage error".to_string()
            }
            other => other.to_string(),
        };

        Self {
            status,
            code: err.code(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_size_errors_map_to_core_variants() {
        let err: FilesError = BackendError::SizeMismatch {
            expected: 10,
            actual: 4,
        }
        .into();
        assert!(matches!(
            err,
            FilesError::SizeMismatch {
                expected: 10,
                actual: 4
            }
        ));

        let err: FilesError = BackendError::LimitExceeded { limit: 3 }.into();
        assert!(matches!(err, FilesError::FileTooLarge { limit: 3 }));
    }

    #[test]
    fn storage_failures_hide_paths_from_clients() {
        let err = FilesError::from(BackendError::NotFound("/srv/data/ab/cd/ef/data".into()));
        let app = AppError::from(err);
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(app.code, "StorageBackend");
        assert!(!app.message.contains("/srv/data"));
    }

    #[test]
    fn range_errors_keep_their_own_status() {
        let app = AppError::from(FilesError::RangeNotSatisfiable { size: 4 });
        assert_eq!(app.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(app.code, "RangeNotSatisfiable");
    }
}
