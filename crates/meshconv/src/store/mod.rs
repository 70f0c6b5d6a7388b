//! Job Record Store: the single source of truth for client-visible job state.
//!
//! Every record carries a fixed expiry. Reads hide expired records even before
//! [`JobRecordStore::purge_expired`] physically reclaims them, and updates are
//! applied as one atomic read-merge-write that never moves the expiry.

use std::time::Duration;

use crate::error::StoreError;
use crate::job::{Job, JobUpdate, NewJob};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

/// A live job together with the time left before it expires.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEntry {
    pub job: Job,
    /// Derived from the stored expiry, not from `created_at`.
    pub ttl_remaining: Duration,
}

/// Lazy sequence of live jobs returned by [`JobRecordStore::list_all`].
pub type JobIter<'a> = Box<dyn Iterator<Item = Result<Job, StoreError>> + Send + 'a>;

pub trait JobRecordStore: Send + Sync {
    /// Stores a new record in `queued` state expiring `ttl` from now.
    ///
    /// Fails with [`StoreError::DuplicateId`] if the id was ever stored and
    /// has not been purged.
    fn create(&self, job: NewJob, ttl: Duration) -> Result<Job, StoreError>;

    /// Returns a live record or [`StoreError::NotFound`].
    fn get(&self, id: &str) -> Result<JobEntry, StoreError>;

    /// Atomically merges `update` into a live record and returns the result.
    fn update(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError>;

    /// Removes a record. Removing an absent id is not an error.
    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// All live records, for operational tooling.
    fn list_all(&self) -> JobIter<'_>;

    /// Physically removes expired records. Returns how many were removed.
    fn purge_expired(&self) -> Result<usize, StoreError>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every `JobRecordStore` implementation must share.

    use super::*;
    use crate::job::{ConversionOptions, JobStatus, SourceFormat, INITIAL_PROGRESS};

    pub fn new_job(id: &str) -> NewJob {
        NewJob::new(
            id,
            format!("/uploads/{}.stl", id),
            ConversionOptions {
                tolerance: 0.01,
                repair: true,
                format: SourceFormat::Stl,
            },
        )
    }

    const HOUR: Duration = Duration::from_secs(3600);

    pub fn create_then_get(store: &dyn JobRecordStore) {
        let created = store.create(new_job("c1"), HOUR).unwrap();
        assert_eq!(created.status, JobStatus::Queued);

        let entry = store.get("c1").unwrap();
        assert_eq!(entry.job, created);
        assert!(entry.ttl_remaining <= HOUR);
        assert!(entry.ttl_remaining > HOUR - Duration::from_secs(60));
    }

    pub fn duplicate_id_rejected(store: &dyn JobRecordStore) {
        store.create(new_job("dup"), HOUR).unwrap();
        let err = store.create(new_job("dup"), HOUR).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "dup"));
    }

    pub fn missing_is_not_found(store: &dyn JobRecordStore) {
        assert!(matches!(store.get("nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.update("nope", JobUpdate::message("x")),
            Err(StoreError::NotFound(_))
        ));
    }

    pub fn update_preserves_expiry(store: &dyn JobRecordStore) {
        let created = store.create(new_job("u1"), HOUR).unwrap();

        store
            .update("u1", JobUpdate::processing(INITIAL_PROGRESS, "Converting"))
            .unwrap();
        for p in 11..30 {
            store
                .update("u1", JobUpdate::processing(p, "Converting"))
                .unwrap();
        }
        let done = store
            .update(
                "u1",
                JobUpdate::completed("/outputs/u1.step", serde_json::json!({"facets": 3})),
            )
            .unwrap();

        assert_eq!(done.expires_at, created.expires_at);
        assert_eq!(done.created_at, created.created_at);
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.updated_at >= created.updated_at);
        assert_eq!(store.get("u1").unwrap().job.expires_at, created.expires_at);
    }

    pub fn terminal_is_immutable(store: &dyn JobRecordStore) {
        store.create(new_job("t1"), HOUR).unwrap();
        store
            .update("t1", JobUpdate::processing(INITIAL_PROGRESS, "Converting"))
            .unwrap();
        store.update("t1", JobUpdate::failed("bad mesh")).unwrap();

        let err = store
            .update("t1", JobUpdate::processing(50, "late"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Terminal(_)));
        let job = store.get("t1").unwrap().job;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("bad mesh"));
    }

    pub fn illegal_transition_rejected(store: &dyn JobRecordStore) {
        store.create(new_job("i1"), HOUR).unwrap();
        let err = store
            .update(
                "i1",
                JobUpdate::completed("/outputs/i1.step", serde_json::json!({})),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.get("i1").unwrap().job.status, JobStatus::Queued);
    }

    pub fn delete_is_idempotent(store: &dyn JobRecordStore) {
        store.create(new_job("d1"), HOUR).unwrap();
        store.delete("d1").unwrap();
        store.delete("d1").unwrap();
        store.delete("never-existed").unwrap();
        assert!(matches!(store.get("d1"), Err(StoreError::NotFound(_))));
    }

    pub fn expired_records_are_hidden(store: &dyn JobRecordStore) {
        store.create(new_job("gone"), Duration::ZERO).unwrap();
        store.create(new_job("live"), HOUR).unwrap();

        assert!(matches!(store.get("gone"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.update("gone", JobUpdate::processing(10, "x")),
            Err(StoreError::NotFound(_))
        ));
        let ids: Vec<String> = store.list_all().map(|j| j.unwrap().id).collect();
        assert_eq!(ids, vec!["live".to_string()]);

        // Not yet purged, so the id is still taken.
        assert!(matches!(
            store.create(new_job("gone"), HOUR),
            Err(StoreError::DuplicateId(_))
        ));
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.purge_expired().unwrap(), 0);
    }

    pub fn list_all_is_complete(store: &dyn JobRecordStore) {
        for i in 0..25 {
            store.create(new_job(&format!("job-{:02}", i)), HOUR).unwrap();
        }
        let mut ids: Vec<String> = store.list_all().map(|j| j.unwrap().id).collect();
        ids.sort();
        assert_eq!(ids.len(), 25);
        assert_eq!(ids.first().map(String::as_str), Some("job-00"));
        assert_eq!(ids.last().map(String::as_str), Some("job-24"));
    }

    pub fn run_all(make: impl Fn() -> Box<dyn JobRecordStore>) {
        create_then_get(make().as_ref());
        duplicate_id_rejected(make().as_ref());
        missing_is_not_found(make().as_ref());
        update_preserves_expiry(make().as_ref());
        terminal_is_immutable(make().as_ref());
        illegal_transition_rejected(make().as_ref());
        delete_is_idempotent(make().as_ref());
        expired_records_are_hidden(make().as_ref());
        list_all_is_complete(make().as_ref());
    }
}
