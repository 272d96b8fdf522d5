use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failures of the import pipeline.
///
/// Row-level problems never show up here; the normalizer reports them as
/// [`crate::normalizer::SkipReason`] values instead.
#[derive(Debug, Error)]
pub enum ImportError {
    /// File extension is not one of csv, txt, xlsx, xlsm.
    #[error("unsupported file format: '{0}' (expected .csv, .txt, .xlsx or .xlsm)")]
    UnsupportedFormat(String),

    /// No candidate encoding could decode the file.
    #[error("unable to decode file: {0}")]
    Decode(String),

    /// More data rows than chunk indexes can address.
    #[error("file has too many rows to import: {0}")]
    TooManyRows(usize),

    /// The blocking extraction task panicked or was cancelled.
    #[error("extraction task failed: {0}")]
    ExtractionTask(String),

    #[error("failed to read '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Publishing to or consuming from the queue failed.
    #[error("queue connection error: {0}")]
    QueueConnection(String),

    /// A chunk's upserts could not be committed.
    #[error("chunk transaction failed: {0}")]
    Transaction(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A queue message that can never be processed.
    #[error("invalid chunk message: {0}")]
    InvalidMessage(String),

    #[error("import job {0} not found")]
    JobNotFound(i64),
}

/// Application-specific error types for the HTTP surface.
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Resource not found error.
    NotFound(String),
    /// Bad request error (invalid input).
    BadRequest(String),
    /// Internal server error.
    InternalError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl IntoResponse for AppError {
    /// Maps each variant to a status code and a JSON body, logging server-side
    /// failures.
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<ImportError> for AppError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Database(e) => AppError::DatabaseError(e),
            ImportError::JobNotFound(id) => AppError::NotFound(format!("import job {}", id)),
            ImportError::UnsupportedFormat(_) | ImportError::InvalidMessage(_) => {
                AppError::BadRequest(err.to_string())
            }
            other => AppError::InternalError(other.to_string()),
        }
    }
}
