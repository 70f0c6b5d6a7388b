//! Durable job store on the shared SQLite [`Database`].

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{JobEntry, JobIter, JobRecordStore};
use crate::db::job_repo::{self, JobRow};
use crate::db::{from_millis, to_millis, Database, DatabaseError};
use crate::error::StoreError;
use crate::job::{ConversionOptions, Job, JobStatus, JobUpdate, NewJob};

/// Rows fetched per round trip by [`JobRecordStore::list_all`].
const LIST_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    db: Database,
}

impl SqliteJobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn to_row(job: &Job) -> Result<JobRow, DatabaseError> {
    let options = serde_json::to_string(&job.options).map_err(|source| DatabaseError::Json {
        column: "options",
        source,
    })?;
    let result = job
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|source| DatabaseError::Json {
            column: "result",
            source,
        })?;
    Ok(JobRow {
        id: job.id.clone(),
        status: job.status.as_str().to_string(),
        progress: i64::from(job.progress),
        message: job.message.clone(),
        error: job.error.clone(),
        input_ref: job.input_ref.clone(),
        output_ref: job.output_ref.clone(),
        options,
        result,
        created_at: job.created_at.to_rfc3339(),
        updated_at: job.updated_at.to_rfc3339(),
        expires_at: to_millis(job.expires_at),
    })
}

fn from_row(row: JobRow) -> Result<Job, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        id: row.id.clone(),
        reason,
    };
    let status = JobStatus::parse(&row.status)
        .ok_or_else(|| corrupt(format!("unknown status '{}'", row.status)))?;
    let options: ConversionOptions = serde_json::from_str(&row.options)
        .map_err(|e| corrupt(format!("bad options: {}", e)))?;
    let result: Option<serde_json::Value> = row
        .result
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| corrupt(format!("bad result: {}", e)))?;
    let parse_time = |value: &str, column: &str| {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("bad {}: {}", column, e)))
    };
    let created_at = parse_time(&row.created_at, "created_at")?;
    let updated_at = parse_time(&row.updated_at, "updated_at")?;

    Ok(Job {
        status,
        progress: row.progress.clamp(0, 100) as u8,
        message: row.message,
        error: row.error,
        input_ref: row.input_ref,
        output_ref: row.output_ref,
        options,
        result,
        created_at,
        updated_at,
        expires_at: from_millis(row.expires_at),
        id: row.id,
    })
}

impl JobRecordStore for SqliteJobStore {
    fn create(&self, job: NewJob, ttl: Duration) -> Result<Job, StoreError> {
        let job = job.into_job(Utc::now(), ttl);
        let row = to_row(&job)?;
        let inserted = self.db.with_conn(|conn| match job_repo::insert(conn, &row) {
            Ok(()) => Ok(true),
            Err(e) if e.is_constraint_violation() => Ok(false),
            Err(e) => Err(e),
        })?;
        if !inserted {
            return Err(StoreError::DuplicateId(job.id));
        }
        log::debug!("Created job {} expiring at {}", job.id, job.expires_at);
        Ok(job)
    }

    fn get(&self, id: &str) -> Result<JobEntry, StoreError> {
        let now = Utc::now();
        let row = self
            .db
            .with_conn(|conn| job_repo::find_live(conn, id, to_millis(now)))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let job = from_row(row)?;
        Ok(JobEntry {
            ttl_remaining: job.ttl_remaining_at(now),
            job,
        })
    }

    fn update(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError> {
        let now = Utc::now();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let row = match job_repo::find_live(&tx, id, to_millis(now))? {
                Some(row) => row,
                None => return Ok(Err(StoreError::NotFound(id.to_string()))),
            };
            let mut job = match from_row(row) {
                Ok(job) => job,
                Err(e) => return Ok(Err(e)),
            };
            if let Err(e) = job.apply(update, now) {
                return Ok(Err(e));
            }
            job_repo::update(&tx, &to_row(&job)?)?;
            tx.commit()?;
            Ok(Ok(job))
        })?
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let removed = self.db.with_conn(|conn| job_repo::delete(conn, id))?;
        if removed > 0 {
            log::debug!("Deleted job record {}", id);
        }
        Ok(())
    }

    fn list_all(&self) -> JobIter<'_> {
        Box::new(LivePages {
            db: &self.db,
            now_ms: to_millis(Utc::now()),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let now_ms = to_millis(Utc::now());
        let purged = self
            .db
            .with_conn(|conn| job_repo::purge_expired(conn, now_ms))?;
        if purged > 0 {
            log::info!("Purged {} expired job record(s)", purged);
        }
        Ok(purged)
    }
}

/// Keyset-paged iterator over live jobs. The expiry cut-off is fixed when
/// iteration starts.
struct LivePages<'a> {
    db: &'a Database,
    now_ms: i64,
    after: Option<String>,
    buffer: VecDeque<JobRow>,
    exhausted: bool,
}

impl Iterator for LivePages<'_> {
    type Item = Result<Job, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self.db.with_conn(|conn| {
                job_repo::page_live(conn, self.after.as_deref(), self.now_ms, LIST_PAGE_SIZE)
            });
            match page {
                Ok(rows) => {
                    self.exhausted = rows.len() < LIST_PAGE_SIZE as usize;
                    if let Some(last) = rows.last() {
                        self.after = Some(last.id.clone());
                    }
                    self.buffer.extend(rows);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e.into()));
                }
            }
        }
        self.buffer.pop_front().map(from_row)
    }
}
