//! Job repository: SQL for the `jobs` table.
//!
//! Functions take a borrowed `Connection` so callers can compose several
//! statements inside one lock/transaction (read-merge-write).

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub status: String,
    pub progress: i64,
    pub message: String,
    pub error: Option<String>,
    pub input_ref: String,
    pub output_ref: Option<String>,
    /// JSON-encoded `ConversionOptions`.
    pub options: String,
    /// JSON-encoded converter report.
    pub result: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Unix milliseconds.
    pub expires_at: i64,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            message: row.get("message")?,
            error: row.get("error")?,
            input_ref: row.get("input_ref")?,
            output_ref: row.get("output_ref")?,
            options: row.get("options")?,
            result: row.get("result")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            expires_at: row.get("expires_at")?,
        })
    }
}

/// Inserts a new job row. Fails with a constraint violation on a duplicate id.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, status, progress, message, error, input_ref, output_ref,
         options, result, created_at, updated_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            job.id,
            job.status,
            job.progress,
            job.message,
            job.error,
            job.input_ref,
            job.output_ref,
            job.options,
            job.result,
            job.created_at,
            job.updated_at,
            job.expires_at,
        ],
    )?;
    Ok(())
}

/// Overwrites the mutable columns. `created_at`, `expires_at` and `options`
/// are never written after insert.
pub fn update(conn: &Connection, job: &JobRow) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status=?2, progress=?3, message=?4, error=?5, output_ref=?6,
         result=?7, updated_at=?8
         WHERE id=?1",
        params![
            job.id,
            job.status,
            job.progress,
            job.message,
            job.error,
            job.output_ref,
            job.result,
            job.updated_at,
        ],
    )?;
    Ok(changed)
}

/// Finds a job that has not yet expired at `now_ms`.
pub fn find_live(
    conn: &Connection,
    id: &str,
    now_ms: i64,
) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1 AND expires_at > ?2",
            params![id, now_ms],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Deletes a job regardless of expiry. Returns the number of rows removed.
pub fn delete(conn: &Connection, id: &str) -> Result<usize, DatabaseError> {
    Ok(conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?)
}

/// Fetches up to `limit` live jobs ordered by id, strictly after `after_id`.
pub fn page_live(
    conn: &Connection,
    after_id: Option<&str>,
    now_ms: i64,
    limit: u32,
) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE expires_at > ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            params![now_ms, after_id.unwrap_or(""), limit],
            JobRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Physically removes rows whose expiry has passed.
pub fn purge_expired(conn: &Connection, now_ms: i64) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM jobs WHERE expires_at <= ?1",
        params![now_ms],
    )?)
}

/// Returns true if any row (expired or not) holds this id.
pub fn id_exists(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id], |r| r.get(0))
        .optional()?;
    Ok(found.is_some())
}
