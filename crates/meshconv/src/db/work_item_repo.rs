//! Work item repository: SQL for the `work_items` table.
//!
//! `seq` is the AUTOINCREMENT key and doubles as enqueue order.
//! Every state change is guarded by the expected current state so a stale
//! caller cannot resurrect an item another caller already moved on.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

pub const STATE_PENDING: &str = "pending";
pub const STATE_IN_FLIGHT: &str = "in_flight";
pub const STATE_COMPLETED: &str = "completed";
pub const STATE_FAILED: &str = "failed";

/// A raw work item row.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItemRow {
    pub seq: i64,
    pub job_id: String,
    pub input_ref: String,
    pub output_ref: String,
    pub options: String,
    pub priority: i64,
    pub attempt: i64,
    pub max_attempts: i64,
    pub state: String,
    pub worker_id: Option<String>,
    pub available_at: i64,
    pub last_error: Option<String>,
    pub enqueued_at: i64,
    pub finished_at: Option<i64>,
}

impl WorkItemRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            seq: row.get("seq")?,
            job_id: row.get("job_id")?,
            input_ref: row.get("input_ref")?,
            output_ref: row.get("output_ref")?,
            options: row.get("options")?,
            priority: row.get("priority")?,
            attempt: row.get("attempt")?,
            max_attempts: row.get("max_attempts")?,
            state: row.get("state")?,
            worker_id: row.get("worker_id")?,
            available_at: row.get("available_at")?,
            last_error: row.get("last_error")?,
            enqueued_at: row.get("enqueued_at")?,
            finished_at: row.get("finished_at")?,
        })
    }
}

/// Inserts a pending item and returns its assigned `seq`. `row.seq` is ignored.
pub fn insert(conn: &Connection, row: &WorkItemRow) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO work_items (job_id, input_ref, output_ref, options, priority, attempt,
         max_attempts, state, available_at, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9)",
        params![
            row.job_id,
            row.input_ref,
            row.output_ref,
            row.options,
            row.priority,
            row.attempt,
            row.max_attempts,
            row.available_at,
            row.enqueued_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find(conn: &Connection, seq: i64) -> Result<Option<WorkItemRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM work_items WHERE seq = ?1",
            params![seq],
            WorkItemRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Most recently enqueued item for a job, in any state.
pub fn latest_for_job(
    conn: &Connection,
    job_id: &str,
) -> Result<Option<WorkItemRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM work_items WHERE job_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![job_id],
            WorkItemRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Next dispatchable item: priority ascending, then enqueue order.
pub fn next_available(conn: &Connection, now_ms: i64) -> Result<Option<i64>, DatabaseError> {
    let seq = conn
        .query_row(
            "SELECT seq FROM work_items
             WHERE state = 'pending' AND available_at <= ?1
             ORDER BY priority ASC, seq ASC
             LIMIT 1",
            params![now_ms],
            |r| r.get(0),
        )
        .optional()?;
    Ok(seq)
}

/// Marks a pending item in flight for `worker_id` and counts the attempt.
pub fn claim(conn: &Connection, seq: i64, worker_id: &str) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE work_items SET state = 'in_flight', worker_id = ?2, attempt = attempt + 1
         WHERE seq = ?1 AND state = 'pending'",
        params![seq, worker_id],
    )?)
}

pub fn mark_completed(conn: &Connection, seq: i64, now_ms: i64) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE work_items SET state = 'completed', worker_id = NULL, finished_at = ?2
         WHERE seq = ?1 AND state = 'in_flight'",
        params![seq, now_ms],
    )?)
}

pub fn mark_failed(
    conn: &Connection,
    seq: i64,
    now_ms: i64,
    error: &str,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE work_items SET state = 'failed', worker_id = NULL, finished_at = ?2,
         last_error = ?3
         WHERE seq = ?1 AND state = 'in_flight'",
        params![seq, now_ms, error],
    )?)
}

/// Puts an in-flight item back in the pending set after a failed attempt.
pub fn reschedule(
    conn: &Connection,
    seq: i64,
    available_at: i64,
    error: &str,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE work_items SET state = 'pending', worker_id = NULL, available_at = ?2,
         last_error = ?3
         WHERE seq = ?1 AND state = 'in_flight'",
        params![seq, available_at, error],
    )?)
}

/// Returns an in-flight item to pending without consuming an attempt.
pub fn release(conn: &Connection, seq: i64, available_at: i64) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE work_items SET state = 'pending', worker_id = NULL, available_at = ?2,
         attempt = MAX(attempt - 1, 0)
         WHERE seq = ?1 AND state = 'in_flight'",
        params![seq, available_at],
    )?)
}

/// Requeues in-flight items, optionally only those held by one worker.
/// The interrupted attempt is not counted.
pub fn requeue_in_flight(
    conn: &Connection,
    worker_id: Option<&str>,
    now_ms: i64,
) -> Result<usize, DatabaseError> {
    let changed = match worker_id {
        Some(worker_id) => conn.execute(
            "UPDATE work_items SET state = 'pending', worker_id = NULL, available_at = ?2,
             attempt = MAX(attempt - 1, 0)
             WHERE state = 'in_flight' AND worker_id = ?1",
            params![worker_id, now_ms],
        )?,
        None => conn.execute(
            "UPDATE work_items SET state = 'pending', worker_id = NULL, available_at = ?1,
             attempt = MAX(attempt - 1, 0)
             WHERE state = 'in_flight'",
            params![now_ms],
        )?,
    };
    Ok(changed)
}

pub fn delete(conn: &Connection, seq: i64) -> Result<usize, DatabaseError> {
    Ok(conn.execute("DELETE FROM work_items WHERE seq = ?1", params![seq])?)
}

/// Removes pending items for a job. In-flight items are left to finish.
pub fn delete_pending_for_job(conn: &Connection, job_id: &str) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM work_items WHERE job_id = ?1 AND state = 'pending'",
        params![job_id],
    )?)
}

/// True if the job still has a pending or in-flight item.
pub fn has_active_for_job(conn: &Connection, job_id: &str) -> Result<bool, DatabaseError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM work_items
             WHERE job_id = ?1 AND state IN ('pending', 'in_flight')
             LIMIT 1",
            params![job_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Deletes finished items in `state` that are older than `cutoff_ms`, then
/// trims the remainder to the newest `keep` rows.
pub fn purge_finished(
    conn: &Connection,
    state: &str,
    cutoff_ms: i64,
    keep: u32,
) -> Result<usize, DatabaseError> {
    let aged = conn.execute(
        "DELETE FROM work_items WHERE state = ?1 AND finished_at < ?2",
        params![state, cutoff_ms],
    )?;
    let trimmed = conn.execute(
        "DELETE FROM work_items WHERE state = ?1 AND seq NOT IN (
             SELECT seq FROM work_items WHERE state = ?1
             ORDER BY finished_at DESC, seq DESC
             LIMIT ?2
         )",
        params![state, keep],
    )?;
    Ok(aged + trimmed)
}

/// Row counts grouped by state.
pub fn count_by_state(conn: &Connection) -> Result<Vec<(String, u64)>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM work_items GROUP BY state")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_item(job_id: &str, priority: i64) -> WorkItemRow {
        WorkItemRow {
            seq: 0,
            job_id: job_id.to_string(),
            input_ref: format!("/uploads/{}.stl", job_id),
            output_ref: format!("/outputs/{}.step", job_id),
            options: "{}".to_string(),
            priority,
            attempt: 0,
            max_attempts: 3,
            state: STATE_PENDING.to_string(),
            worker_id: None,
            available_at: 0,
            last_error: None,
            enqueued_at: 0,
            finished_at: None,
        }
    }

    #[test]
    fn test_next_available_orders_by_priority_then_seq() {
        let db = test_db();
        db.with_conn(|conn| {
            let a = insert(conn, &sample_item("a", 0))?;
            let b = insert(conn, &sample_item("b", -1))?;
            let c = insert(conn, &sample_item("c", 0))?;
            assert!(a < c);

            assert_eq!(next_available(conn, 10)?, Some(b));
            claim(conn, b, "w0")?;
            assert_eq!(next_available(conn, 10)?, Some(a));
            claim(conn, a, "w0")?;
            assert_eq!(next_available(conn, 10)?, Some(c));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_claim_is_guarded_by_state() {
        let db = test_db();
        db.with_conn(|conn| {
            let seq = insert(conn, &sample_item("a", 0))?;
            assert_eq!(claim(conn, seq, "w0")?, 1);
            assert_eq!(claim(conn, seq, "w1")?, 0);

            let row = find(conn, seq)?.unwrap();
            assert_eq!(row.state, STATE_IN_FLIGHT);
            assert_eq!(row.worker_id.as_deref(), Some("w0"));
            assert_eq!(row.attempt, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delayed_item_not_available_yet() {
        let db = test_db();
        db.with_conn(|conn| {
            let mut item = sample_item("late", 0);
            item.available_at = 5_000;
            insert(conn, &item)?;
            assert_eq!(next_available(conn, 4_999)?, None);
            assert!(next_available(conn, 5_000)?.is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_requeue_in_flight_for_one_worker() {
        let db = test_db();
        db.with_conn(|conn| {
            let a = insert(conn, &sample_item("a", 0))?;
            let b = insert(conn, &sample_item("b", 0))?;
            claim(conn, a, "w0")?;
            claim(conn, b, "w1")?;

            assert_eq!(requeue_in_flight(conn, Some("w0"), 0)?, 1);
            let a_row = find(conn, a)?.unwrap();
            assert_eq!(a_row.state, STATE_PENDING);
            assert_eq!(a_row.attempt, 0);
            assert_eq!(find(conn, b)?.unwrap().state, STATE_IN_FLIGHT);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_purge_finished_keeps_newest() {
        let db = test_db();
        db.with_conn(|conn| {
            for (i, job) in ["a", "b", "c", "d"].iter().enumerate() {
                let seq = insert(conn, &sample_item(job, 0))?;
                claim(conn, seq, "w0")?;
                mark_completed(conn, seq, 1_000 + i as i64)?;
            }

            assert_eq!(purge_finished(conn, STATE_COMPLETED, 0, 2)?, 2);
            let counts = count_by_state(conn)?;
            assert_eq!(counts, vec![(STATE_COMPLETED.to_string(), 2)]);
            assert!(latest_for_job(conn, "d")?.is_some());
            assert!(latest_for_job(conn, "a")?.is_none());
            Ok(())
        })
        .unwrap();
    }
}
