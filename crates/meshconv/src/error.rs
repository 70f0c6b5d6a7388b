use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::job::JobStatus;

#[derive(Error, Debug)]
pub enum MeshconvError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Work queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Poll cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] crate::telemetry::TelemetryError),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid value for environment variable {name}: '{value}'")]
    InvalidEnv { name: String, value: String },
}

/// Rejected submissions. Raised before a job exists, never retried.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Tolerance {value} is outside the allowed range [{min}, {max}]")]
    ToleranceOutOfRange { value: f64, min: f64, max: f64 },

    #[error("Unsupported mesh format: {0}")]
    UnsupportedFormat(String),

    #[error("Input file not found: {0}")]
    InputMissing(PathBuf),

    #[error("Invalid job id '{0}': expected 1-64 characters from [A-Za-z0-9_-]")]
    InvalidJobId(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job id already exists: {0}")]
    DuplicateId(String),

    #[error("Invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {0} is in a terminal state and cannot be modified")]
    Terminal(String),

    #[error("Corrupt job record '{id}': {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Job store unavailable: {0}")]
    Unavailable(#[from] crate::db::DatabaseError),
}

impl StoreError {
    /// True for backend failures that may succeed on a later attempt.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Work queue unavailable: {0}")]
    Unavailable(#[from] crate::db::DatabaseError),

    #[error("Work item {0} is not in flight")]
    NotInFlight(i64),

    #[error("Corrupt work item {seq}: {reason}")]
    Corrupt { seq: i64, reason: String },
}

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Failed to spawn converter '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Converter timed out after {0:?}")]
    Timeout(Duration),

    /// Diagnostic reported by the converter itself.
    #[error("{0}")]
    Failed(String),

    #[error("Converter produced an unreadable report: {0}")]
    BadReport(String),

    #[error("Converter I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Converter panicked: {0}")]
    Panicked(String),
}

impl ConversionError {
    /// Message written to the job's `error` field.
    pub fn diagnostic(&self) -> String {
        match self {
            ConversionError::Failed(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove file '{path}': {source}")]
    RemoveFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing artifact path for invalid job id '{0}'")]
    InvalidJobId(String),

    #[error("Failed to scan directory '{path}': {source}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Failures persisting the client-side polling cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced synchronously at the submission, status and deletion boundaries.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job id conflict: {0}")]
    Conflict(String),

    #[error("Backend unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Artifact storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::DuplicateId(id) => ServiceError::Conflict(id),
            other => ServiceError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<QueueError> for ServiceError {
    fn from(err: QueueError) -> Self {
        ServiceError::StoreUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeshconvError>;
