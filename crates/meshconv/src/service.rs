//! Submission, status and deletion boundaries.
//!
//! `ConversionService` is what an upload layer or API handler talks to. It
//! validates requests, keeps the job record, input artifact and work item
//! consistent with each other, and answers status queries from the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::broadcast::JobEventBroadcaster;
use crate::config::{Config, ValidationConfig};
use crate::error::{ServiceError, StoreError, ValidationError};
use crate::job::{validate_job_id, ConversionOptions, Job, NewJob, SourceFormat};
use crate::poll::{FetchError, JobSnapshot, StatusSource};
use crate::queue::{NewWorkItem, QueueStats, WorkQueue};
use crate::storage::ArtifactStore;
use crate::store::JobRecordStore;

/// A staged upload plus the options the client asked for.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// Caller-chosen id. A fresh UUID is used when absent.
    pub job_id: Option<String>,
    pub staged_input: PathBuf,
    /// Client-side file name, used for format detection.
    pub original_name: Option<String>,
    pub tolerance: Option<f64>,
    pub repair: Option<bool>,
    pub format: Option<SourceFormat>,
    pub priority: i32,
}

impl SubmitRequest {
    pub fn new<P: AsRef<Path>>(staged_input: P) -> Self {
        Self {
            staged_input: staged_input.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: String,
    pub expires_at: DateTime<Utc>,
}

pub struct ConversionService {
    store: Arc<dyn JobRecordStore>,
    queue: Arc<WorkQueue>,
    artifacts: ArtifactStore,
    validation: ValidationConfig,
    ttl: Duration,
    events: Option<JobEventBroadcaster>,
}

impl ConversionService {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        queue: Arc<WorkQueue>,
        artifacts: ArtifactStore,
        validation: ValidationConfig,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            artifacts,
            validation,
            ttl,
            events: None,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn JobRecordStore>,
        queue: Arc<WorkQueue>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self::new(
            store,
            queue,
            artifacts,
            config.validation.clone(),
            config.jobs.ttl(),
        )
    }

    pub fn with_events(mut self, events: JobEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Creates a job for a staged upload and enqueues its first attempt.
    ///
    /// Nothing is left behind on failure: a record whose input could not be
    /// adopted or whose work item could not be enqueued is deleted again.
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, ServiceError> {
        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        validate_job_id(&job_id)?;
        let options = self.validate(&request)?;

        let input_path = self.artifacts.input_path(&job_id, options.format);
        let new_job = NewJob::new(&job_id, path_ref(&input_path), options);
        let job = self.store.create(new_job, self.ttl)?;

        if let Err(e) = self
            .artifacts
            .adopt_input(&request.staged_input, &job_id, options.format)
        {
            self.rollback(&job_id, false);
            return Err(e.into());
        }

        let output_path = self.artifacts.output_path(&job_id);
        let item = NewWorkItem::for_job(&job, path_ref(&output_path));
        if let Err(e) = self.queue.enqueue(item, request.priority) {
            self.rollback(&job_id, true);
            return Err(e.into());
        }

        tracing::info!(
            job_id = %job_id,
            format = %options.format,
            tolerance = options.tolerance,
            repair = options.repair,
            "job submitted"
        );
        if let Some(events) = &self.events {
            events.queued(&job_id);
        }

        Ok(SubmitReceipt {
            job_id,
            expires_at: job.expires_at,
        })
    }

    /// Current state of a live job.
    pub fn status(&self, job_id: &str) -> Result<JobSnapshot, ServiceError> {
        if validate_job_id(job_id).is_err() {
            return Err(ServiceError::NotFound(job_id.to_string()));
        }
        let entry = self.store.get(job_id)?;
        Ok(snapshot_of(&entry.job, entry.ttl_remaining))
    }

    /// Removes a job, its pending work and its artifacts. Deleting an unknown
    /// or malformed id succeeds without touching anything.
    ///
    /// The record goes first: if that fails the job is still queued and
    /// will run. A worker that claims the item before it is cancelled finds
    /// the record gone and discards it. An attempt already running is left
    /// to finish and its result is dropped the same way.
    pub fn delete(&self, job_id: &str) -> Result<(), ServiceError> {
        if validate_job_id(job_id).is_err() {
            tracing::debug!(job_id, "ignoring delete of malformed job id");
            return Ok(());
        }
        self.store.delete(job_id)?;
        let cancelled = self.queue.cancel_job(job_id)?;
        let removed = self.artifacts.remove_job_artifacts(job_id)?;
        tracing::info!(job_id, cancelled, removed, "job deleted");
        if let Some(events) = &self.events {
            events.deleted(job_id);
        }
        Ok(())
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, ServiceError> {
        self.store
            .list_all()
            .collect::<Result<Vec<_>, StoreError>>()
            .map_err(ServiceError::from)
    }

    pub fn queue_stats(&self) -> Result<QueueStats, ServiceError> {
        Ok(self.queue.stats()?)
    }

    fn validate(&self, request: &SubmitRequest) -> Result<ConversionOptions, ValidationError> {
        if !request.staged_input.is_file() {
            return Err(ValidationError::InputMissing(request.staged_input.clone()));
        }

        let format = match request.format {
            Some(format) => format,
            None => detect_format(request)?,
        };
        if !self.validation.allowed_formats.contains(&format) {
            return Err(ValidationError::UnsupportedFormat(format.to_string()));
        }

        let tolerance = request
            .tolerance
            .unwrap_or(self.validation.default_tolerance);
        let (min, max) = (self.validation.min_tolerance, self.validation.max_tolerance);
        // NaN fails the range check too.
        if !(min..=max).contains(&tolerance) {
            return Err(ValidationError::ToleranceOutOfRange {
                value: tolerance,
                min,
                max,
            });
        }

        Ok(ConversionOptions {
            tolerance,
            repair: request.repair.unwrap_or(true),
            format,
        })
    }

    fn rollback(&self, job_id: &str, remove_artifacts: bool) {
        if let Err(e) = self.store.delete(job_id) {
            tracing::error!(job_id, error = %e, "failed to roll back job record");
        }
        if remove_artifacts {
            if let Err(e) = self.artifacts.remove_job_artifacts(job_id) {
                tracing::error!(job_id, error = %e, "failed to roll back job artifacts");
            }
        }
    }
}

impl StatusSource for ConversionService {
    fn fetch(&self, job_id: &str) -> Result<JobSnapshot, FetchError> {
        match self.status(job_id) {
            Ok(snapshot) => Ok(snapshot),
            Err(ServiceError::NotFound(_)) => Err(FetchError::NotFound),
            Err(e) => Err(FetchError::Transient(e.to_string())),
        }
    }
}

fn detect_format(request: &SubmitRequest) -> Result<SourceFormat, ValidationError> {
    let name = request
        .original_name
        .as_deref()
        .map(Path::new)
        .unwrap_or(request.staged_input.as_path());
    SourceFormat::from_path(name).ok_or_else(|| {
        let ext = name
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.display().to_string());
        ValidationError::UnsupportedFormat(ext)
    })
}

fn snapshot_of(job: &Job, ttl_remaining: Duration) -> JobSnapshot {
    JobSnapshot {
        id: job.id.clone(),
        status: job.status,
        progress: job.progress,
        message: job.message.clone(),
        error: job.error.clone(),
        result: job.result.clone(),
        ttl_remaining_secs: ttl_remaining.as_secs(),
    }
}

fn path_ref(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
