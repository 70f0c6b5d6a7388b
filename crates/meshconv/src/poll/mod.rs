//! Client half of the status polling protocol.
//!
//! Each tracked job is an explicit [`PollState`] machine. A
//! [`PollScheduler`] drives the machines by deadline and a [`ClientCache`]
//! persists the last seen state so polling resumes after a restart.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PollingConfig;
use crate::job::JobStatus;

pub mod cache;
pub mod scheduler;

pub use cache::{CachedJob, ClientCache};
pub use scheduler::{PollScheduler, PollUpdate};

/// What a status query returns for a live job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub ttl_remaining_secs: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The job expired or was deleted. Ends polling.
    #[error("job not found")]
    NotFound,

    /// Network trouble or a server-side failure. Polling backs off and retries.
    #[error("transient fetch failure: {0}")]
    Transient(String),
}

/// Anything that can answer a status query.
pub trait StatusSource: Send + Sync {
    fn fetch(&self, job_id: &str) -> Result<JobSnapshot, FetchError>;
}

impl<T: StatusSource + ?Sized> StatusSource for Arc<T> {
    fn fetch(&self, job_id: &str) -> Result<JobSnapshot, FetchError> {
        (**self).fetch(job_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Terminal(JobStatus),
    NotFound,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    ActivePolling,
    BackoffPolling,
    Stopped(StopReason),
}

impl PollState {
    /// Transition after one fetch. `Stopped` absorbs everything.
    pub fn next(self, outcome: &Result<JobSnapshot, FetchError>) -> PollState {
        if let PollState::Stopped(_) = self {
            return self;
        }
        match outcome {
            Ok(snapshot) if snapshot.status.is_terminal() => {
                PollState::Stopped(StopReason::Terminal(snapshot.status))
            }
            Ok(_) => PollState::ActivePolling,
            Err(FetchError::NotFound) => PollState::Stopped(StopReason::NotFound),
            Err(FetchError::Transient(_)) => PollState::BackoffPolling,
        }
    }

    /// Delay before the next fetch, `None` once stopped.
    pub fn delay(&self, intervals: &PollIntervals) -> Option<Duration> {
        match self {
            PollState::ActivePolling => Some(intervals.active),
            PollState::BackoffPolling => Some(intervals.backoff),
            PollState::Stopped(_) => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, PollState::Stopped(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub active: Duration,
    pub backoff: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            active: Duration::from_millis(1500),
            backoff: Duration::from_millis(3000),
        }
    }
}

impl PollIntervals {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            active: Duration::from_millis(config.active_interval_ms),
            backoff: Duration::from_millis(config.backoff_interval_ms),
        }
    }
}
