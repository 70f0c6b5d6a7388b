//! Job lifecycle broadcaster for live status streaming.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

/// What happened to a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Queued,
    Started,
    Retrying,
    Completed,
    Failed,
    Deleted,
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEventKind::Queued => write!(f, "Queued"),
            JobEventKind::Started => write!(f, "Started"),
            JobEventKind::Retrying => write!(f, "Retrying"),
            JobEventKind::Completed => write!(f, "Completed"),
            JobEventKind::Failed => write!(f, "Failed"),
            JobEventKind::Deleted => write!(f, "Deleted"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub kind: JobEventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Attempt number (set on start and retry).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Backoff before the next attempt (set on retry).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
    /// Output path (set on completion).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    /// Error message (set on retry and failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    pub fn new(job_id: &str, kind: JobEventKind, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind,
            message: message.to_string(),
            timestamp: Utc::now(),
            attempt: None,
            retry_in_ms: None,
            output_ref: None,
            error: None,
        }
    }
}

/// Broadcasts job lifecycle events to any number of subscribers.
///
/// Sending never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers see `RecvError::Lagged`.
#[derive(Clone, Debug)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Logs every event on a background thread until all broadcasters are
    /// dropped. The handle yields how many events were logged.
    pub fn spawn_logger(&self) -> std::io::Result<JoinHandle<usize>> {
        let mut rx = self.subscribe();
        thread::Builder::new()
            .name("job-events".to_string())
            .spawn(move || {
                let mut logged = 0;
                loop {
                    match rx.blocking_recv() {
                        Ok(event) => {
                            logged += 1;
                            tracing::debug!(
                                job_id = %event.job_id,
                                kind = %event.kind,
                                attempt = event.attempt,
                                error = event.error.as_deref(),
                                "{}",
                                event.message
                            );
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Job event logger fell behind");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                logged
            })
    }

    pub fn queued(&self, job_id: &str) {
        self.send(JobEvent::new(job_id, JobEventKind::Queued, "Queued for conversion"));
    }

    pub fn started(&self, job_id: &str, attempt: u32) {
        let mut event = JobEvent::new(job_id, JobEventKind::Started, "Converting");
        event.attempt = Some(attempt);
        self.send(event);
    }

    pub fn retrying(&self, job_id: &str, attempt: u32, delay: Duration, error: &str) {
        let mut event = JobEvent::new(job_id, JobEventKind::Retrying, "Retry scheduled");
        event.attempt = Some(attempt);
        event.retry_in_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        event.error = Some(error.to_string());
        self.send(event);
    }

    pub fn completed(&self, job_id: &str, output_ref: &str) {
        let mut event = JobEvent::new(job_id, JobEventKind::Completed, "Conversion completed");
        event.output_ref = Some(output_ref.to_string());
        self.send(event);
    }

    pub fn failed(&self, job_id: &str, error: &str) {
        let mut event = JobEvent::new(job_id, JobEventKind::Failed, "Conversion failed");
        event.error = Some(error.to_string());
        self.send(event);
    }

    pub fn deleted(&self, job_id: &str) {
        self.send(JobEvent::new(job_id, JobEventKind::Deleted, "Job deleted"));
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
