//! Error types for the extraction pipeline.

use thiserror::Error;
use uuid::Uuid;

use crate::models::JobState;

/// Result type alias using the pipeline's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input (bad upload, malformed request)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Upload exceeds the configured size ceiling
    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// Upload is not a PDF
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Extraction worker reported a failure
    #[error("Worker error: {0}")]
    Worker(String),

    /// Extraction worker answered with output that cannot be accepted
    #[error("malformed worker output: {0}")]
    MalformedOutput(String),

    /// Extraction worker did not finish inside the job budget
    #[error("Worker timeout: job exceeded {0}s budget")]
    WorkerTimeout(u64),

    /// The reconciliation engine itself broke (not a failed check)
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    /// Illegal job state transition
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    /// Operation conflicts with current state (e.g. job already in flight)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of errors, following the pipeline's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected synchronously, no job created.
    Validation,
    /// Extraction failed or timed out.
    Worker,
    /// The engine broke while reconciling.
    Reconciliation,
    /// Unknown or incomplete document/job.
    NotFound,
    /// Request conflicts with in-flight work.
    Conflict,
    /// Storage, network, configuration and other plumbing failures.
    Infrastructure,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_)
            | Error::PayloadTooLarge { .. }
            | Error::UnsupportedMediaType(_) => ErrorKind::Validation,
            Error::Worker(_) | Error::MalformedOutput(_) | Error::WorkerTimeout(_) => {
                ErrorKind::Worker
            }
            Error::Reconciliation(_) => ErrorKind::Reconciliation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) | Error::InvalidTransition { .. } => ErrorKind::Conflict,
            Error::Database(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Request(_)
            | Error::Internal(_)
            | Error::Io(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
