//! Periodic reclamation of expired records, finished queue items and
//! artifacts nobody owns any more.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::config::Config;
use crate::error::{MeshconvError, StoreError};
use crate::queue::{RetentionPolicy, WorkQueue};
use crate::storage::{Artifact, ArtifactStore};
use crate::store::JobRecordStore;

#[derive(Debug, Clone)]
pub struct SweepPolicy {
    pub interval: Duration,
    /// Files modified more recently than this are left alone, covering the
    /// gap between a file landing on disk and its job record appearing.
    pub min_artifact_age: Duration,
    pub retention: RetentionPolicy,
}

impl SweepPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.sweeper.interval_secs),
            min_artifact_age: Duration::from_secs(config.sweeper.min_artifact_age_secs),
            retention: config.queue.retention.policy(),
        }
    }
}

/// Counters from one [`CleanupSweeper::run_once`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired_records: usize,
    pub purged_items: usize,
    pub artifacts_scanned: usize,
    pub artifacts_removed: usize,
    pub artifacts_kept: usize,
    pub remove_errors: usize,
}

pub struct CleanupSweeper {
    store: Arc<dyn JobRecordStore>,
    queue: Arc<WorkQueue>,
    artifacts: ArtifactStore,
    policy: SweepPolicy,
}

impl CleanupSweeper {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        queue: Arc<WorkQueue>,
        artifacts: ArtifactStore,
        policy: SweepPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            artifacts,
            policy,
        }
    }

    /// One full pass. Aborts without deleting anything further if the job
    /// store cannot answer whether an artifact is still owned.
    pub fn run_once(&self) -> Result<SweepReport, MeshconvError> {
        let span = info_span!("sweeper.run");
        let _enter = span.enter();

        let mut report = SweepReport {
            expired_records: self.store.purge_expired()?,
            purged_items: self.queue.purge_finished(&self.policy.retention)?,
            ..SweepReport::default()
        };

        let now = SystemTime::now();
        for artifact in self.artifacts.list_artifacts()? {
            report.artifacts_scanned += 1;

            let age = now.duration_since(artifact.modified).unwrap_or_default();
            if age < self.policy.min_artifact_age || self.is_owned(&artifact)? {
                report.artifacts_kept += 1;
                continue;
            }

            match self.artifacts.remove_artifact(&artifact) {
                Ok(true) => {
                    debug!(path = %artifact.path.display(), "Removed orphaned artifact");
                    report.artifacts_removed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to remove orphaned artifact");
                    report.remove_errors += 1;
                }
            }
        }

        if report.expired_records + report.purged_items + report.artifacts_removed > 0 {
            info!(
                expired_records = report.expired_records,
                purged_items = report.purged_items,
                artifacts_removed = report.artifacts_removed,
                "Sweep finished"
            );
        }
        Ok(report)
    }

    /// An artifact is owned while its job record is live or while the queue
    /// still holds work for it, even if the record itself has expired.
    fn is_owned(&self, artifact: &Artifact) -> Result<bool, MeshconvError> {
        match self.store.get(&artifact.job_id) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(self.queue.has_active_item(&artifact.job_id)?),
            Err(StoreError::Corrupt { id, reason }) => {
                warn!(job_id = %id, reason = %reason, "Keeping artifact of unreadable job record");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs [`CleanupSweeper::run_once`] every `policy.interval` on a
    /// background thread until the handle is stopped.
    pub fn start(self: Arc<Self>) -> SweeperHandle {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = self.policy.interval;

        let handle = thread::spawn(move || {
            info!(interval_secs = interval.as_secs(), "Cleanup sweeper started");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = self.run_once() {
                            error!(error = %e, "Sweep aborted");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("Cleanup sweeper stopped");
        });

        SweeperHandle { stop_tx, handle }
    }
}

pub struct SweeperHandle {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the loop and waits for an in-progress sweep to finish.
    pub fn stop(self) {
        let _ = self.stop_tx.try_send(());
        if self.handle.join().is_err() {
            error!("Cleanup sweeper thread panicked");
        }
    }
}
