//! In-process job store used by tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

use super::{JobEntry, JobIter, JobRecordStore};
use crate::error::StoreError;
use crate::job::{Job, JobUpdate, NewJob};

/// Job records held in a `HashMap` behind an `RwLock`.
///
/// Expired records stay in the map until [`JobRecordStore::purge_expired`]
/// runs but are invisible to every read.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Job>> {
        self.jobs.read().unwrap_or_else(|poisoned| {
            log::warn!("Job map lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Job>> {
        self.jobs.write().unwrap_or_else(|poisoned| {
            log::warn!("Job map lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl JobRecordStore for MemoryJobStore {
    fn create(&self, job: NewJob, ttl: Duration) -> Result<Job, StoreError> {
        let mut jobs = self.write();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }
        let job = job.into_job(Utc::now(), ttl);
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    fn get(&self, id: &str) -> Result<JobEntry, StoreError> {
        let now = Utc::now();
        let jobs = self.read();
        match jobs.get(id) {
            Some(job) if !job.is_expired_at(now) => Ok(JobEntry {
                ttl_remaining: job.ttl_remaining_at(now),
                job: job.clone(),
            }),
            _ => Err(StoreError::NotFound(id.to_string())),
        }
    }

    fn update(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut jobs = self.write();
        let job = match jobs.get_mut(id) {
            Some(job) if !job.is_expired_at(now) => job,
            _ => return Err(StoreError::NotFound(id.to_string())),
        };
        // Merge into a copy so a rejected update leaves the record untouched.
        let mut merged = job.clone();
        merged.apply(update, now)?;
        *job = merged.clone();
        Ok(merged)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.write().remove(id);
        Ok(())
    }

    /// Snapshots the live records up front rather than streaming them, so
    /// the lock is not held while the caller iterates. Memory use grows with
    /// the number of jobs; the SQLite store pages instead.
    fn list_all(&self) -> JobIter<'_> {
        let now = Utc::now();
        let live: Vec<Job> = self
            .read()
            .values()
            .filter(|job| !job.is_expired_at(now))
            .cloned()
            .collect();
        Box::new(live.into_iter().map(Ok))
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, job| !job.is_expired_at(now));
        Ok(before - jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[test]
    fn test_memory_store_contract() {
        contract::run_all(|| Box::new(MemoryJobStore::new()));
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        use std::sync::Arc;

        let store = Arc::new(MemoryJobStore::new());
        store
            .create(contract::new_job("race"), Duration::from_secs(60))
            .unwrap();
        store
            .update("race", JobUpdate::processing(10, "Converting"))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .update("race", JobUpdate::message(format!("writer {}", i)))
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let job = store.get("race").unwrap().job;
        assert!(job.message.starts_with("writer "));
        assert_eq!(job.progress, 10);
    }

    #[test]
    fn test_list_all_is_a_snapshot() {
        let store = MemoryJobStore::new();
        store
            .create(contract::new_job("a"), Duration::from_secs(60))
            .unwrap();

        let mut listing = store.list_all();
        // Writes while iterating neither block nor leak into the listing.
        store
            .create(contract::new_job("b"), Duration::from_secs(60))
            .unwrap();
        store.delete("a").unwrap();

        let first = listing.next().unwrap().unwrap();
        assert_eq!(first.id, "a");
        assert!(listing.next().is_none());
    }
}
