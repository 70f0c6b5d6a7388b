//! Isolated job lifecycle environment.
//!
//! Every harness owns a temp directory for uploads and outputs and an
//! in-memory SQLite database shared by the job store and the work queue.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use meshconv::config::ValidationConfig;
use meshconv::poll::JobSnapshot;
use meshconv::queue::RetryPolicy;
use meshconv::store::JobRecordStore;
use meshconv::{
    ArtifactStore, ConversionService, Converter, Database, JobStatus, ServiceError,
    SqliteJobStore, SubmitRequest, WorkQueue, WorkQueueConfig, WorkerContext, WorkerPool,
    WorkerPoolConfig,
};

/// Knobs the scenarios vary.
#[derive(Debug, Clone)]
pub struct HarnessSettings {
    pub ttl: Duration,
    pub max_concurrent: usize,
    pub max_attempts: u32,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_concurrent: 2,
            max_attempts: 3,
        }
    }
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub store: Arc<dyn JobRecordStore>,
    pub queue: Arc<WorkQueue>,
    pub service: Arc<ConversionService>,
    pub artifacts: ArtifactStore,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(HarnessSettings::default())
    }

    pub fn with_settings(settings: HarnessSettings) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open_in_memory().expect("Failed to open database");

        let store: Arc<dyn JobRecordStore> = Arc::new(SqliteJobStore::new(db.clone()));
        let queue = Arc::new(WorkQueue::new(
            db,
            WorkQueueConfig {
                retry: RetryPolicy {
                    max_attempts: settings.max_attempts,
                    base: Duration::from_millis(5),
                    cap: Duration::from_millis(20),
                },
                max_concurrent: settings.max_concurrent,
                poll_interval: Duration::from_millis(10),
            },
        ));
        let artifacts = ArtifactStore::new(
            temp_dir.path().join("uploads"),
            temp_dir.path().join("outputs"),
        );
        artifacts.ensure_dirs().expect("Failed to create artifact dirs");

        let service = Arc::new(ConversionService::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            artifacts.clone(),
            ValidationConfig::default(),
            settings.ttl,
        ));

        Self {
            temp_dir,
            store,
            queue,
            service,
            artifacts,
        }
    }

    pub fn temp_path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    /// Writes a small ASCII STL where an upload layer would stage it.
    pub fn stage_input(&self, name: &str) -> PathBuf {
        let staging = self.temp_dir.path().join("staging");
        std::fs::create_dir_all(&staging).expect("Failed to create staging dir");
        let path = staging.join(name);
        std::fs::write(&path, b"solid part\nendsolid part\n").expect("Failed to stage input");
        path
    }

    /// Stages and submits an STL with default options.
    pub fn submit(&self, name: &str) -> String {
        let staged = self.stage_input(name);
        self.service
            .submit(SubmitRequest::new(staged))
            .expect("Submission failed")
            .job_id
    }

    pub fn start_pool(&self, converter: Arc<dyn Converter>, worker_count: usize) -> WorkerPool {
        WorkerPool::start(
            WorkerContext {
                store: Arc::clone(&self.store),
                queue: Arc::clone(&self.queue),
                converter,
                events: None,
            },
            WorkerPoolConfig {
                worker_count,
                store_write_attempts: 3,
                store_retry_base: Duration::from_millis(5),
            },
        )
    }

    pub fn status(&self, job_id: &str) -> Result<JobSnapshot, ServiceError> {
        self.service.status(job_id)
    }

    /// Polls until the job reports `status`, panicking after `timeout`.
    pub fn wait_for_status(&self, job_id: &str, status: JobStatus, timeout: Duration) -> JobSnapshot {
        let mut last = None;
        let found = wait_until(timeout, || match self.status(job_id) {
            Ok(snapshot) if snapshot.status == status => true,
            other => {
                last = Some(format!("{:?}", other));
                false
            }
        });
        assert!(found, "job {} never reached {}; last seen {:?}", job_id, status, last);
        self.status(job_id).expect("Job vanished after reaching status")
    }
}

/// Spins on `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
