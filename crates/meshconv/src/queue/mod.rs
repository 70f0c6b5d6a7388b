//! Durable work queue with retry bookkeeping and a concurrency gate.
//!
//! Items live in the `work_items` table next to the job records. A claimed
//! item is returned as a [`Lease`] that also holds an [`AdmissionGate`]
//! permit, so no more than `max_concurrent` items are ever in flight no matter
//! how many workers are dequeuing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::work_item_repo::{self as repo, STATE_COMPLETED, STATE_FAILED};
use crate::db::{to_millis, Database};
use crate::error::QueueError;

pub mod gate;
pub mod item;
pub mod policy;

pub use gate::{AdmissionGate, Permit};
pub use item::{NewWorkItem, WorkItem, WorkItemState};
pub use policy::{RetentionPolicy, RetryPolicy};

/// Buffered wake-ups; further enqueues while full are picked up by polling.
const WAKE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    pub retry: RetryPolicy,
    /// Upper bound on simultaneously in-flight items across all workers.
    pub max_concurrent: usize,
    /// Longest a blocked `dequeue` sleeps before re-checking for due items.
    pub poll_interval: Duration,
}

impl WorkQueueConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.queue.retry_policy(),
            max_concurrent: config.workers.max_concurrent,
            poll_interval: Duration::from_millis(config.workers.poll_interval_ms),
        }
    }
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent: 2,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// An in-flight item held by one worker.
///
/// Must be handed back through [`WorkQueue::complete`], [`WorkQueue::fail`],
/// [`WorkQueue::release`] or [`WorkQueue::discard`]. Dropping it without doing
/// so frees the concurrency slot but leaves the row in flight until
/// [`WorkQueue::requeue_worker`] or [`WorkQueue::recover_in_flight`] runs.
#[derive(Debug)]
pub struct Lease {
    item: WorkItem,
    _permit: Permit,
}

impl Lease {
    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    pub fn job_id(&self) -> &str {
        &self.item.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.item.attempt
    }
}

/// Result of [`WorkQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The item goes back to pending and becomes due after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// The attempt budget is spent; the job must be marked failed.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub failed: u64,
    /// Gate permits currently held.
    pub permits_in_use: usize,
    pub max_concurrent: usize,
}

pub struct WorkQueue {
    db: Database,
    retry: RetryPolicy,
    gate: AdmissionGate,
    poll_interval: Duration,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("retry", &self.retry)
            .field("gate", &self.gate)
            .field("poll_interval", &self.poll_interval)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

fn now_ms() -> i64 {
    to_millis(Utc::now())
}

fn after(delay: Duration) -> i64 {
    now_ms().saturating_add(duration_ms(delay))
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl WorkQueue {
    pub fn new(db: Database, config: WorkQueueConfig) -> Self {
        let (wake_tx, wake_rx) = bounded(WAKE_CAPACITY);
        Self {
            db,
            retry: config.retry,
            gate: AdmissionGate::new(config.max_concurrent),
            poll_interval: config.poll_interval,
            wake_tx,
            wake_rx,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Appends a pending item, durable once this returns.
    pub fn enqueue(&self, new: NewWorkItem, priority: i32) -> Result<WorkItem, QueueError> {
        let now = Utc::now();
        let mut item = WorkItem {
            seq: 0,
            job_id: new.job_id,
            input_ref: new.input_ref,
            output_ref: new.output_ref,
            options: new.options,
            priority,
            attempt: 0,
            max_attempts: self.retry.max_attempts,
            state: WorkItemState::Pending,
            worker_id: None,
            available_at: now,
            last_error: None,
            enqueued_at: now,
            finished_at: None,
        };
        let row = item.to_row()?;
        item.seq = self.db.with_conn(|conn| repo::insert(conn, &row))?;

        debug!(job_id = %item.job_id, seq = item.seq, priority, "Enqueued work item");
        let _ = self.wake_tx.try_send(());
        Ok(item)
    }

    /// Blocks until an item is claimed for `worker_id` or the queue shuts
    /// down (`Ok(None)`).
    ///
    /// Waits for a gate permit first, then claims the next due item by
    /// priority and enqueue order. While nothing is due the permit is
    /// returned and the caller sleeps on the wake channel, bounded by the
    /// poll interval so retry backoffs are noticed.
    pub fn dequeue(&self, worker_id: &str) -> Result<Option<Lease>, QueueError> {
        loop {
            if self.is_shutdown() {
                return Ok(None);
            }
            let Some(permit) = self.gate.acquire_timeout(self.poll_interval) else {
                continue;
            };
            if let Some(item) = self.claim_next(worker_id)? {
                return Ok(Some(Lease {
                    item,
                    _permit: permit,
                }));
            }
            drop(permit);
            let _ = self.wake_rx.recv_timeout(self.poll_interval);
        }
    }

    /// Claims a due item without waiting. `Ok(None)` if the gate is full or
    /// nothing is due.
    pub fn try_dequeue(&self, worker_id: &str) -> Result<Option<Lease>, QueueError> {
        let Some(permit) = self.gate.try_acquire() else {
            return Ok(None);
        };
        Ok(self.claim_next(worker_id)?.map(|item| Lease {
            item,
            _permit: permit,
        }))
    }

    fn claim_next(&self, worker_id: &str) -> Result<Option<WorkItem>, QueueError> {
        let now = now_ms();
        let row = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let Some(seq) = repo::next_available(&tx, now)? else {
                return Ok(None);
            };
            if repo::claim(&tx, seq, worker_id)? == 0 {
                return Ok(None);
            }
            let row = repo::find(&tx, seq)?;
            tx.commit()?;
            Ok(row)
        })?;
        let Some(row) = row else {
            return Ok(None);
        };
        let item = WorkItem::try_from(row)?;
        debug!(
            job_id = %item.job_id,
            seq = item.seq,
            worker_id,
            attempt = item.attempt,
            "Claimed work item"
        );
        Ok(Some(item))
    }

    /// Records a successful execution.
    pub fn complete(&self, lease: Lease) -> Result<(), QueueError> {
        let seq = lease.item.seq;
        let changed = self
            .db
            .with_conn(|conn| repo::mark_completed(conn, seq, now_ms()))?;
        if changed == 0 {
            return Err(QueueError::NotInFlight(seq));
        }
        debug!(job_id = %lease.item.job_id, seq, "Work item completed");
        Ok(())
    }

    /// Records a failed execution and either schedules a retry with backoff
    /// or marks the item permanently failed.
    pub fn fail(&self, lease: Lease, error: &str) -> Result<FailOutcome, QueueError> {
        let item = &lease.item;
        let attempt = item.attempt;
        let outcome = if item.has_attempts_left() {
            let delay = self.retry.delay_for(attempt);
            let changed = self
                .db
                .with_conn(|conn| repo::reschedule(conn, item.seq, after(delay), error))?;
            if changed == 0 {
                return Err(QueueError::NotInFlight(item.seq));
            }
            FailOutcome::Retry { attempt, delay }
        } else {
            let changed = self
                .db
                .with_conn(|conn| repo::mark_failed(conn, item.seq, now_ms(), error))?;
            if changed == 0 {
                return Err(QueueError::NotInFlight(item.seq));
            }
            FailOutcome::Exhausted { attempts: attempt }
        };

        match outcome {
            FailOutcome::Retry { delay, .. } => warn!(
                job_id = %item.job_id,
                seq = item.seq,
                attempt,
                max_attempts = item.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Work item failed, retry scheduled"
            ),
            FailOutcome::Exhausted { .. } => warn!(
                job_id = %item.job_id,
                seq = item.seq,
                attempt,
                "Work item failed, attempts exhausted"
            ),
        }
        Ok(outcome)
    }

    /// Hands an item back untouched, for example when the job record could
    /// not be written. The attempt is not counted.
    pub fn release(&self, lease: Lease, delay: Duration) -> Result<(), QueueError> {
        let seq = lease.item.seq;
        let changed = self
            .db
            .with_conn(|conn| repo::release(conn, seq, after(delay)))?;
        if changed == 0 {
            return Err(QueueError::NotInFlight(seq));
        }
        debug!(job_id = %lease.item.job_id, seq, "Work item released");
        Ok(())
    }

    /// Drops an item whose job no longer exists or is already terminal.
    pub fn discard(&self, lease: Lease) -> Result<(), QueueError> {
        let seq = lease.item.seq;
        self.db.with_conn(|conn| repo::delete(conn, seq))?;
        debug!(job_id = %lease.item.job_id, seq, "Discarded orphaned work item");
        Ok(())
    }

    /// Removes the job's pending items. An in-flight attempt is left to run.
    pub fn cancel_job(&self, job_id: &str) -> Result<usize, QueueError> {
        let removed = self
            .db
            .with_conn(|conn| repo::delete_pending_for_job(conn, job_id))?;
        if removed > 0 {
            debug!(job_id, removed, "Cancelled pending work items");
        }
        Ok(removed)
    }

    /// Moves every in-flight item back to pending. Run once at startup,
    /// before any worker dequeues, to recover from a crash.
    pub fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let recovered = self
            .db
            .with_conn(|conn| repo::requeue_in_flight(conn, None, now_ms()))?;
        if recovered > 0 {
            info!(recovered, "Recovered in-flight work items");
            let _ = self.wake_tx.try_send(());
        }
        Ok(recovered)
    }

    /// Moves items held by one worker back to pending.
    pub fn requeue_worker(&self, worker_id: &str) -> Result<usize, QueueError> {
        let requeued = self
            .db
            .with_conn(|conn| repo::requeue_in_flight(conn, Some(worker_id), now_ms()))?;
        if requeued > 0 {
            info!(worker_id, requeued, "Requeued work items of worker");
            let _ = self.wake_tx.try_send(());
        }
        Ok(requeued)
    }

    /// Applies the retention policy to finished items.
    pub fn purge_finished(&self, retention: &RetentionPolicy) -> Result<usize, QueueError> {
        let now = now_ms();
        let completed_cutoff = now.saturating_sub(duration_ms(retention.completed_max_age));
        let failed_cutoff = now.saturating_sub(duration_ms(retention.failed_max_age));
        let purged = self.db.with_conn(|conn| {
            let completed = repo::purge_finished(
                conn,
                STATE_COMPLETED,
                completed_cutoff,
                retention.completed_max,
            )?;
            let failed =
                repo::purge_finished(conn, STATE_FAILED, failed_cutoff, retention.failed_max)?;
            Ok(completed + failed)
        })?;
        if purged > 0 {
            debug!(purged, "Purged finished work items");
        }
        Ok(purged)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let counts = self.db.with_conn(repo::count_by_state)?;
        let mut stats = QueueStats {
            permits_in_use: self.gate.in_use(),
            max_concurrent: self.gate.capacity(),
            ..QueueStats::default()
        };
        for (state, count) in counts {
            match WorkItemState::parse(&state) {
                Some(WorkItemState::Pending) => stats.pending = count,
                Some(WorkItemState::InFlight) => stats.in_flight = count,
                Some(WorkItemState::Completed) => stats.completed = count,
                Some(WorkItemState::Failed) => stats.failed = count,
                None => warn!(state = %state, count, "Unknown work item state"),
            }
        }
        Ok(stats)
    }

    pub fn latest_for_job(&self, job_id: &str) -> Result<Option<WorkItem>, QueueError> {
        self.db
            .with_conn(|conn| repo::latest_for_job(conn, job_id))?
            .map(WorkItem::try_from)
            .transpose()
    }

    /// True while the job has a pending or in-flight item.
    pub fn has_active_item(&self, job_id: &str) -> Result<bool, QueueError> {
        Ok(self
            .db
            .with_conn(|conn| repo::has_active_for_job(conn, job_id))?)
    }

    /// Makes every blocked and future `dequeue` return `Ok(None)`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for _ in 0..WAKE_CAPACITY {
            if self.wake_tx.try_send(()).is_err() {
                break;
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
