//! Persistent client-side view of submitted jobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobSnapshot;
use crate::error::CacheError;
use crate::job::JobStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedJob {
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// The server no longer knows this job.
    #[serde(default)]
    pub gone: bool,
    pub seen_at: DateTime<Utc>,
}

impl CachedJob {
    /// Whether polling should continue after a restart.
    pub fn is_resumable(&self) -> bool {
        !self.gone && !self.status.is_terminal()
    }
}

/// Job views keyed by id, saved as one JSON document.
#[derive(Debug)]
pub struct ClientCache {
    path: PathBuf,
    jobs: BTreeMap<String, CachedJob>,
}

impl ClientCache {
    /// Loads the cache at `path`. A missing file yields an empty cache.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let jobs = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(CacheError::Io { path, source: e }),
        };
        Ok(Self { path, jobs })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, job_id: &str) -> Option<&CachedJob> {
        self.jobs.get(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Records a job the client just submitted.
    pub fn record_submitted(&mut self, job_id: &str) {
        self.jobs.insert(
            job_id.to_string(),
            CachedJob {
                status: JobStatus::Queued,
                progress: 0,
                message: String::new(),
                error: None,
                result: None,
                gone: false,
                seen_at: Utc::now(),
            },
        );
    }

    pub fn apply_snapshot(&mut self, snapshot: &JobSnapshot) {
        self.jobs.insert(
            snapshot.id.clone(),
            CachedJob {
                status: snapshot.status,
                progress: snapshot.progress,
                message: snapshot.message.clone(),
                error: snapshot.error.clone(),
                result: snapshot.result.clone(),
                gone: false,
                seen_at: Utc::now(),
            },
        );
    }

    pub fn mark_gone(&mut self, job_id: &str) {
        if let Some(job) = self.jobs.get_mut(job_id) {
            job.gone = true;
            job.seen_at = Utc::now();
        }
    }

    pub fn remove(&mut self, job_id: &str) -> Option<CachedJob> {
        self.jobs.remove(job_id)
    }

    /// Ids whose last known status was not terminal.
    pub fn resumable(&self) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|(_, job)| job.is_resumable())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Writes the cache through a sibling temp file and a rename, so a crash
    /// mid-write leaves the previous version intact.
    pub fn save(&self) -> Result<(), CacheError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CacheError::Io { path, source }
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let content = serde_json::to_vec_pretty(&self.jobs)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        Ok(())
    }
}
