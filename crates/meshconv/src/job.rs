//! Job data model and status state machine.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, ValidationError};

/// Progress written when a worker picks a job up.
pub const INITIAL_PROGRESS: u8 = 10;

pub const MAX_JOB_ID_LEN: usize = 64;

/// Job ids name files on disk, so only `[A-Za-z0-9_-]{1,64}` is accepted.
pub fn validate_job_id(id: &str) -> Result<(), ValidationError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_JOB_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidJobId(id.to_string()))
    }
}

/// Client-visible status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// `completed` and `failed` have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Returns true if `next` is a legal successor of `self`.
    ///
    /// `processing -> processing` carries progress updates. A retry keeps the
    /// job in `processing`; nothing ever returns to `queued`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mesh formats accepted as conversion input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Stl,
    Obj,
    Ply,
    Off,
}

impl SourceFormat {
    pub const ALL: [SourceFormat; 4] = [
        SourceFormat::Stl,
        SourceFormat::Obj,
        SourceFormat::Ply,
        SourceFormat::Off,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            SourceFormat::Stl => "stl",
            SourceFormat::Obj => "obj",
            SourceFormat::Ply => "ply",
            SourceFormat::Off => "off",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }

    /// Detects the format from a file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Conversion parameters captured at submission. Never mutated afterwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversionOptions {
    pub tolerance: f64,
    pub repair: bool,
    pub format: SourceFormat,
}

/// Fields supplied by the submitter; the store stamps timestamps and expiry.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub input_ref: String,
    pub options: ConversionOptions,
    pub message: String,
}

impl NewJob {
    pub fn new(id: impl Into<String>, input_ref: impl Into<String>, options: ConversionOptions) -> Self {
        Self {
            id: id.into(),
            input_ref: input_ref.into(),
            options,
            message: "Queued for conversion".to_string(),
        }
    }

    /// Builds the stored record. `expires_at` is fixed here and nowhere else.
    pub fn into_job(self, now: DateTime<Utc>, ttl: Duration) -> Job {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        // Millisecond precision, matching what durable stores keep.
        let expires_at =
            DateTime::from_timestamp_millis(expires_at.timestamp_millis()).unwrap_or(expires_at);
        Job {
            id: self.id,
            status: JobStatus::Queued,
            progress: 0,
            message: self.message,
            error: None,
            input_ref: self.input_ref,
            output_ref: None,
            options: self.options,
            result: None,
            created_at: now,
            updated_at: now,
            expires_at,
        }
    }
}

/// A tracked conversion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    /// Advisory, 0-100.
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub input_ref: String,
    /// Unset until the job completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    pub options: ConversionOptions,
    /// Converter metrics, stored verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before the record becomes unreachable.
    pub fn ttl_remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Merges a partial update in place.
    ///
    /// Rejects any change to a terminal job and any status change not allowed
    /// by [`JobStatus::can_transition_to`]. `created_at` and `expires_at` are
    /// never touched.
    pub fn apply(&mut self, update: JobUpdate, now: DateTime<Utc>) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::Terminal(self.id.clone()));
        }
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    id: self.id.clone(),
                    from: self.status,
                    to: next,
                });
            }
            self.status = next;
        }
        if let Some(progress) = update.progress {
            self.progress = progress.min(100);
        }
        if let Some(message) = update.message {
            self.message = message;
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(output_ref) = update.output_ref {
            self.output_ref = Some(output_ref);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Partial job update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub output_ref: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl JobUpdate {
    pub fn processing(progress: u8, message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            progress: Some(progress),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn completed(output_ref: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            message: Some("Conversion completed".to_string()),
            output_ref: Some(output_ref.into()),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            message: Some("Conversion failed".to_string()),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Structured metrics reported by the converter, kept verbatim.
///
/// The payload is opaque to the lifecycle; the accessors only read the fields
/// operational tooling cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversionReport(pub serde_json::Value);

impl ConversionReport {
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// Facet count of the repaired mesh, falling back to the input mesh.
    pub fn facets(&self) -> Option<u64> {
        self.0
            .pointer("/mesh_info_after/facets")
            .or_else(|| self.0.pointer("/mesh_info_before/facets"))
            .or_else(|| self.0.get("facets"))
            .and_then(serde_json::Value::as_u64)
    }

    pub fn is_solid(&self) -> Option<bool> {
        self.0.get("is_solid").and_then(serde_json::Value::as_bool)
    }

    pub fn output_size(&self) -> Option<u64> {
        self.0.get("output_size").and_then(serde_json::Value::as_u64)
    }

    pub fn repairs(&self) -> Vec<&str> {
        self.0
            .get("repairs")
            .and_then(serde_json::Value::as_array)
            .map(|items| items.iter().filter_map(serde_json::Value::as_str).collect())
            .unwrap_or_default()
    }
}
