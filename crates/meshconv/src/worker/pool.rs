use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};

use crate::broadcast::JobEventBroadcaster;
use crate::config::WorkersConfig;
use crate::converter::{ConversionRequest, Converter};
use crate::error::{ConversionError, StoreError};
use crate::job::{JobUpdate, INITIAL_PROGRESS};
use crate::queue::{FailOutcome, Lease, WorkQueue};
use crate::store::JobRecordStore;

/// Shared handles every worker thread receives.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn JobRecordStore>,
    pub queue: Arc<WorkQueue>,
    pub converter: Arc<dyn Converter>,
    pub events: Option<JobEventBroadcaster>,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    /// Tries per job record write while the store is unavailable.
    pub store_write_attempts: u32,
    /// First backoff between those tries; doubles each time.
    pub store_retry_base: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            store_write_attempts: 3,
            store_retry_base: Duration::from_millis(100),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_config(config: &WorkersConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            store_write_attempts: config.store_write_attempts,
            store_retry_base: Duration::from_millis(config.store_retry_base_ms),
        }
    }
}

pub struct WorkerPool {
    workers: Vec<(String, JoinHandle<()>)>,
    queue: Arc<WorkQueue>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `config.worker_count` threads (at least one) that pull from
    /// the queue until [`WorkerPool::shutdown`].
    pub fn start(ctx: WorkerContext, config: WorkerPoolConfig) -> Self {
        let worker_count = config.worker_count.max(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let config = Arc::new(config);

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_id = format!("worker-{}", index);
            let ctx = ctx.clone();
            let config = Arc::clone(&config);
            let shutdown_flag = Arc::clone(&shutdown);
            let id = worker_id.clone();

            let handle = thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || run_worker(&id, &ctx, &config, &shutdown_flag));
            match handle {
                Ok(handle) => workers.push((worker_id, handle)),
                Err(e) => error!(worker_id = %worker_id, error = %e, "Failed to spawn worker"),
            }
        }

        info!(
            workers = workers.len(),
            max_concurrent = ctx.queue.gate().capacity(),
            "Started worker pool"
        );

        Self {
            workers,
            queue: ctx.queue,
            shutdown,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops dequeuing. Attempts already running finish normally.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Release);
        self.queue.shutdown();
    }

    pub fn wait(self) {
        for (worker_id, handle) in self.workers {
            if handle.join().is_err() {
                error!(worker_id = %worker_id, "Worker panicked");
                // Its lease was never settled.
                if let Err(e) = self.queue.requeue_worker(&worker_id) {
                    error!(worker_id = %worker_id, error = %e, "Failed to requeue items");
                }
            } else {
                debug!(worker_id = %worker_id, "Worker finished");
            }
        }
        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

fn run_worker(
    worker_id: &str,
    ctx: &WorkerContext,
    config: &WorkerPoolConfig,
    shutdown: &AtomicBool,
) {
    debug!(worker_id, "Worker started");

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        match ctx.queue.dequeue(worker_id) {
            Ok(Some(lease)) => execute(worker_id, ctx, config, lease),
            Ok(None) => break,
            Err(e) => {
                error!(worker_id, error = %e, "Dequeue failed");
                thread::sleep(config.store_retry_base);
            }
        }
    }

    debug!(worker_id, "Worker stopped");
}

/// Runs one attempt and settles the lease exactly once.
fn execute(worker_id: &str, ctx: &WorkerContext, config: &WorkerPoolConfig, lease: Lease) {
    let item = lease.item().clone();
    let span = info_span!(
        "worker.execute",
        job_id = %item.job_id,
        worker_id,
        attempt = item.attempt
    );
    let _enter = span.enter();

    let message = if item.attempt > 1 {
        format!("Converting (attempt {}/{})", item.attempt, item.max_attempts)
    } else {
        "Converting".to_string()
    };
    let started = write_with_retry(config, || {
        ctx.store
            .update(&item.job_id, JobUpdate::processing(INITIAL_PROGRESS, message.clone()))
    });
    match started {
        Ok(_) => {}
        Err(e) if e.is_unavailable() => {
            error!(error = %e, "Cannot mark job processing, returning item to queue");
            settle(ctx.queue.release(lease, config.store_retry_base));
            return;
        }
        Err(e) => {
            // Deleted, expired or already finished: nobody is waiting for it.
            info!(reason = %e, "Discarding orphaned work item");
            settle(ctx.queue.discard(lease));
            return;
        }
    }
    if let Some(events) = &ctx.events {
        events.started(&item.job_id, item.attempt);
    }

    let request = ConversionRequest {
        job_id: item.job_id.clone(),
        input: PathBuf::from(&item.input_ref),
        output: PathBuf::from(&item.output_ref),
        options: item.options,
        attempt: item.attempt,
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| ctx.converter.convert(&request)))
        .unwrap_or_else(|payload| Err(ConversionError::Panicked(panic_message(payload))));

    match outcome {
        Ok(report) => {
            let result = report.into_value();
            let written = write_with_retry(config, || {
                ctx.store.update(
                    &item.job_id,
                    JobUpdate::completed(item.output_ref.clone(), result.clone()),
                )
            });
            match written {
                Ok(_) => {
                    info!("Conversion completed");
                    settle(ctx.queue.complete(lease));
                    if let Some(events) = &ctx.events {
                        events.completed(&item.job_id, &item.output_ref);
                    }
                }
                Err(e) if e.is_unavailable() => {
                    error!(error = %e, "Cannot record completion, returning item to queue");
                    settle(ctx.queue.release(lease, config.store_retry_base));
                }
                Err(e) => {
                    info!(reason = %e, "Job gone before completion, discarding output");
                    if let Err(io) = std::fs::remove_file(&request.output) {
                        debug!(error = %io, "Output already absent");
                    }
                    settle(ctx.queue.complete(lease));
                }
            }
        }
        Err(err) => {
            let diagnostic = err.diagnostic();
            warn!(error = %err, "Conversion attempt failed");

            match ctx.queue.fail(lease, &diagnostic) {
                Ok(FailOutcome::Retry { attempt, delay }) => {
                    let note = format!(
                        "Attempt {}/{} failed, retrying: {}",
                        attempt, item.max_attempts, diagnostic
                    );
                    record(
                        write_with_retry(config, || {
                            ctx.store.update(&item.job_id, JobUpdate::message(note.clone()))
                        }),
                        "retry note",
                    );
                    if let Some(events) = &ctx.events {
                        events.retrying(&item.job_id, attempt, delay, &diagnostic);
                    }
                }
                Ok(FailOutcome::Exhausted { attempts }) => {
                    error!(attempts, error = %diagnostic, "Conversion failed permanently");
                    record(
                        write_with_retry(config, || {
                            ctx.store
                                .update(&item.job_id, JobUpdate::failed(diagnostic.clone()))
                        }),
                        "failure",
                    );
                    if let Some(events) = &ctx.events {
                        events.failed(&item.job_id, &diagnostic);
                    }
                }
                Err(e) => error!(error = %e, "Failed to record failed attempt"),
            }
        }
    }
}

/// Retries a job record write while the store reports itself unavailable,
/// doubling the pause each time. Other errors return immediately.
pub(crate) fn write_with_retry<T>(
    config: &WorkerPoolConfig,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let attempts = config.store_write_attempts.max(1);
    let mut delay = config.store_retry_base;
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_unavailable() && attempt < attempts => {
                warn!(attempt, attempts, error = %e, "Job store write failed, retrying");
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn record<T>(result: Result<T, StoreError>, what: &str) {
    match result {
        Ok(_) => {}
        Err(e) if e.is_unavailable() => {
            error!(error = %e, "Giving up writing job {}", what)
        }
        Err(e) => debug!(reason = %e, "Skipped job {} write", what),
    }
}

fn settle<E: std::fmt::Display>(result: Result<(), E>) {
    if let Err(e) = result {
        error!(error = %e, "Failed to settle work item");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
