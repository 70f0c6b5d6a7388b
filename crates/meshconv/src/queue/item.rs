use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::work_item_repo::{
    WorkItemRow, STATE_COMPLETED, STATE_FAILED, STATE_IN_FLIGHT, STATE_PENDING,
};
use crate::db::{from_millis, to_millis};
use crate::error::QueueError;
use crate::job::{ConversionOptions, Job};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl WorkItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemState::Pending => STATE_PENDING,
            WorkItemState::InFlight => STATE_IN_FLIGHT,
            WorkItemState::Completed => STATE_COMPLETED,
            WorkItemState::Failed => STATE_FAILED,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            STATE_PENDING => Some(WorkItemState::Pending),
            STATE_IN_FLIGHT => Some(WorkItemState::InFlight),
            STATE_COMPLETED => Some(WorkItemState::Completed),
            STATE_FAILED => Some(WorkItemState::Failed),
            _ => None,
        }
    }
}

/// What the submitter hands the queue. Options are copied from the job and
/// never change afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkItem {
    pub job_id: String,
    pub input_ref: String,
    pub output_ref: String,
    pub options: ConversionOptions,
}

impl NewWorkItem {
    pub fn for_job(job: &Job, output_ref: impl Into<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            input_ref: job.input_ref.clone(),
            output_ref: output_ref.into(),
            options: job.options,
        }
    }
}

/// One execution attempt record owned by the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Enqueue order.
    pub seq: i64,
    pub job_id: String,
    pub input_ref: String,
    pub output_ref: String,
    pub options: ConversionOptions,
    /// Lower runs first.
    pub priority: i32,
    /// Executions started so far, counted at claim.
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: WorkItemState,
    pub worker_id: Option<String>,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Whether a failure of the current attempt may be retried. The budget is
    /// fixed at enqueue, so a later policy change does not affect the item.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub(crate) fn to_row(&self) -> Result<WorkItemRow, QueueError> {
        let options = serde_json::to_string(&self.options).map_err(|e| QueueError::Corrupt {
            seq: self.seq,
            reason: format!("unencodable options: {}", e),
        })?;
        Ok(WorkItemRow {
            seq: self.seq,
            job_id: self.job_id.clone(),
            input_ref: self.input_ref.clone(),
            output_ref: self.output_ref.clone(),
            options,
            priority: i64::from(self.priority),
            attempt: i64::from(self.attempt),
            max_attempts: i64::from(self.max_attempts),
            state: self.state.as_str().to_string(),
            worker_id: self.worker_id.clone(),
            available_at: to_millis(self.available_at),
            last_error: self.last_error.clone(),
            enqueued_at: to_millis(self.enqueued_at),
            finished_at: self.finished_at.map(to_millis),
        })
    }
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = QueueError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        let seq = row.seq;
        let corrupt = |reason: String| QueueError::Corrupt { seq, reason };
        let state = WorkItemState::parse(&row.state)
            .ok_or_else(|| corrupt(format!("unknown state '{}'", row.state)))?;
        let options: ConversionOptions = serde_json::from_str(&row.options)
            .map_err(|e| corrupt(format!("bad options: {}", e)))?;
        let narrow = |value: i64, column: &str| {
            u32::try_from(value).map_err(|_| corrupt(format!("{} out of range: {}", column, value)))
        };

        Ok(WorkItem {
            seq,
            attempt: narrow(row.attempt, "attempt")?,
            max_attempts: narrow(row.max_attempts, "max_attempts")?,
            priority: i32::try_from(row.priority)
                .map_err(|_| corrupt(format!("priority out of range: {}", row.priority)))?,
            job_id: row.job_id,
            input_ref: row.input_ref,
            output_ref: row.output_ref,
            options,
            state,
            worker_id: row.worker_id,
            available_at: from_millis(row.available_at),
            last_error: row.last_error,
            enqueued_at: from_millis(row.enqueued_at),
            finished_at: row.finished_at.map(from_millis),
        })
    }
}
