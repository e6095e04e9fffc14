//! Durable job rows and step checkpoints.
//!
//! A job's `run_at` is the persisted wake-up time: waiting is a row in this
//! table, never an in-memory timer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::{fmt_ts, get_opt_ts, get_parsed, get_ts, set_schedule_in};
use crate::{Post, PostStatus, Store, StoreError};

/// Persisted status of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRecordStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRecordStatus::Pending => "pending",
            JobRecordStatus::Running => "running",
            JobRecordStatus::Completed => "completed",
            JobRecordStatus::Failed => "failed",
            JobRecordStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobRecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobRecordStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobRecordStatus::Pending),
            "running" => Ok(JobRecordStatus::Running),
            "completed" => Ok(JobRecordStatus::Completed),
            "failed" => Ok(JobRecordStatus::Failed),
            "cancelled" => Ok(JobRecordStatus::Cancelled),
            other => Err(StoreError::Corrupt(format!("unknown job status '{}'", other))),
        }
    }
}

/// A job row as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub kind: String,
    /// Key used to cancel every pending job of one post.
    pub correlation_key: String,
    /// JSON-encoded job input.
    pub payload: String,
    pub run_at: DateTime<Utc>,
    pub status: JobRecordStatus,
    /// Attempts started so far, including the running one.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "id, kind, correlation_key, payload, run_at, status, attempts, \
     max_attempts, last_error, created_at, updated_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        correlation_key: row.get(2)?,
        payload: row.get(3)?,
        run_at: get_ts(row, 4)?,
        status: get_parsed(row, 5)?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        last_error: row.get(8)?,
        created_at: get_ts(row, 9)?,
        updated_at: get_ts(row, 10)?,
    })
}

fn insert_job_in(conn: &Connection, job: &JobRecord) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            JOB_COLUMNS
        ),
        params![
            job.id,
            job.kind,
            job.correlation_key,
            job.payload,
            fmt_ts(job.run_at),
            job.status.as_str(),
            job.attempts,
            job.max_attempts,
            job.last_error,
            fmt_ts(job.created_at),
            fmt_ts(job.updated_at),
        ],
    )?;
    Ok(())
}

fn cancel_jobs_in(
    conn: &Connection,
    correlation_key: &str,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'cancelled', updated_at = ?1
         WHERE correlation_key = ?2 AND status = 'pending'",
        params![fmt_ts(now), correlation_key],
    )?;
    Ok(changed)
}

impl Store {
    /// Insert a new job row.
    pub fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        insert_job_in(&conn, job)
    }

    /// Schedule a post at `at` and replace its pending jobs with `jobs`.
    ///
    /// The post update, the cancellation of its previous pending jobs and the
    /// new job rows commit together, so a scheduled post always has its jobs.
    pub fn schedule_post_with_jobs(
        &self,
        id: &str,
        at: DateTime<Utc>,
        jobs: &[JobRecord],
    ) -> Result<Post, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let post = set_schedule_in(&tx, id, Some(at), PostStatus::Scheduled)?;
        let cancelled = cancel_jobs_in(&tx, id, post.updated_at)?;
        for job in jobs {
            insert_job_in(&tx, job)?;
        }
        tx.commit()?;

        debug!(post_id = id, cancelled, jobs = jobs.len(), "scheduled post with jobs");
        Ok(post)
    }

    /// Get a job by id.
    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// All jobs for a correlation key, oldest first.
    pub fn jobs_for(&self, correlation_key: &str) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE correlation_key = ?1 ORDER BY created_at, run_at",
            JOB_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![correlation_key], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Atomically claim up to `limit` pending jobs due at `now`.
    ///
    /// Claimed rows move to `running` with their attempt counter incremented.
    pub fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs WHERE status = 'pending' AND run_at <= ?1
                 ORDER BY run_at LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(params![fmt_ts(now), limit as i64], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            tx.execute(
                "UPDATE jobs SET status = 'running', attempts = attempts + 1, updated_at = ?1
                 WHERE id = ?2",
                params![fmt_ts(now), id],
            )?;
            let job = tx.query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                job_from_row,
            )?;
            claimed.push(job);
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Earliest `run_at` among pending jobs.
    pub fn next_run_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn()?;
        let next = conn.query_row(
            "SELECT MIN(run_at) FROM jobs WHERE status = 'pending'",
            [],
            |row| get_opt_ts(row, 0),
        )?;
        Ok(next)
    }

    /// Mark a job completed.
    pub fn complete_job(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_job_status(id, JobRecordStatus::Completed, None, now)
    }

    /// Mark a job permanently failed.
    pub fn fail_job(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_job_status(id, JobRecordStatus::Failed, Some(error), now)
    }

    fn set_job_status(
        &self,
        id: &str,
        status: JobRecordStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET status = ?1, last_error = COALESCE(?2, last_error), updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), error, fmt_ts(now), id],
        )?;
        Ok(())
    }

    /// Put a running job back to pending for another attempt at `run_at`.
    pub fn retry_job(
        &self,
        id: &str,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET status = 'pending', run_at = ?1, last_error = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'running'",
            params![fmt_ts(run_at), error, fmt_ts(now), id],
        )?;
        Ok(())
    }

    /// Cancel every pending job with the given correlation key.
    ///
    /// Running jobs are untouched. Returns the number of jobs cancelled.
    pub fn cancel_jobs(
        &self,
        correlation_key: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        cancel_jobs_in(&conn, correlation_key, now)
    }

    /// Return jobs left `running` by a dead process to `pending`, due immediately.
    pub fn reset_running_jobs(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'pending', run_at = ?1, updated_at = ?1
             WHERE status = 'running'",
            params![fmt_ts(now)],
        )?;
        Ok(changed)
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Stored output of a completed step.
    pub fn checkpoint(&self, job_id: &str, step: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let output = conn
            .query_row(
                "SELECT output FROM checkpoints WHERE job_id = ?1 AND step = ?2",
                params![job_id, step],
                |row| row.get(0),
            )
            .optional()?;
        Ok(output)
    }

    /// Record a step's output. The first write for a (job, step) wins.
    pub fn save_checkpoint(
        &self,
        job_id: &str,
        step: &str,
        output: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO checkpoints (job_id, step, output, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![job_id, step, output, fmt_ts(now)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(id: &str, key: &str, run_at: DateTime<Utc>) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: id.to_string(),
            kind: "publish".to_string(),
            correlation_key: key.to_string(),
            payload: "{}".to_string(),
            run_at,
            status: JobRecordStatus::Pending,
            attempts: 0,
            max_attempts: 4,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn claim_only_takes_due_jobs_in_run_at_order() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.insert_job(&job("late", "p1", now - Duration::seconds(1))).unwrap();
        store.insert_job(&job("early", "p2", now - Duration::hours(1))).unwrap();
        store.insert_job(&job("future", "p3", now + Duration::hours(1))).unwrap();

        let claimed = store.claim_due_jobs(now, 10).unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert!(claimed.iter().all(|j| j.status == JobRecordStatus::Running));
        assert!(claimed.iter().all(|j| j.attempts == 1));

        // Already claimed jobs are not handed out twice
        assert!(store.claim_due_jobs(now, 10).unwrap().is_empty());
        let next = store.next_run_at().unwrap().unwrap();
        assert!((next - (now + Duration::hours(1))).num_milliseconds().abs() < 1);
    }

    #[test]
    fn claim_respects_limit() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        for i in 0..5 {
            store
                .insert_job(&job(&format!("j{}", i), "p", now - Duration::seconds(i)))
                .unwrap();
        }
        assert_eq!(store.claim_due_jobs(now, 2).unwrap().len(), 2);
        assert_eq!(store.claim_due_jobs(now, 10).unwrap().len(), 3);
    }

    #[test]
    fn cancel_skips_running_jobs() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.insert_job(&job("running", "p1", now)).unwrap();
        store.claim_due_jobs(now, 1).unwrap();
        store.insert_job(&job("waiting", "p1", now + Duration::hours(1))).unwrap();
        store.insert_job(&job("other", "p2", now + Duration::hours(1))).unwrap();

        assert_eq!(store.cancel_jobs("p1", now).unwrap(), 1);
        assert_eq!(
            store.get_job("running").unwrap().unwrap().status,
            JobRecordStatus::Running
        );
        assert_eq!(
            store.get_job("waiting").unwrap().unwrap().status,
            JobRecordStatus::Cancelled
        );
        assert_eq!(
            store.get_job("other").unwrap().unwrap().status,
            JobRecordStatus::Pending
        );
    }

    #[test]
    fn retry_moves_running_job_back_to_pending() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.insert_job(&job("j", "p", now)).unwrap();
        store.claim_due_jobs(now, 1).unwrap();

        let retry_at = now + Duration::seconds(30);
        store.retry_job("j", retry_at, "storage unavailable", now).unwrap();

        let row = store.get_job("j").unwrap().unwrap();
        assert_eq!(row.status, JobRecordStatus::Pending);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.last_error.as_deref(), Some("storage unavailable"));
        assert!(store.claim_due_jobs(now, 1).unwrap().is_empty());
        assert_eq!(store.claim_due_jobs(retry_at, 1).unwrap()[0].attempts, 2);
    }

    #[test]
    fn reset_running_jobs_recovers_interrupted_work() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.insert_job(&job("j", "p", now)).unwrap();
        store.claim_due_jobs(now, 1).unwrap();

        assert_eq!(store.reset_running_jobs(now).unwrap(), 1);
        assert_eq!(store.claim_due_jobs(now, 1).unwrap().len(), 1);
    }

    #[test]
    fn first_checkpoint_wins() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.insert_job(&job("j", "p", now)).unwrap();

        assert!(store.checkpoint("j", "step").unwrap().is_none());
        store.save_checkpoint("j", "step", "\"first\"", now).unwrap();
        store.save_checkpoint("j", "step", "\"second\"", now).unwrap();
        assert_eq!(
            store.checkpoint("j", "step").unwrap().as_deref(),
            Some("\"first\"")
        );
    }

    #[test]
    fn job_status_parses() {
        for status in [
            JobRecordStatus::Pending,
            JobRecordStatus::Running,
            JobRecordStatus::Completed,
            JobRecordStatus::Failed,
            JobRecordStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobRecordStatus>().unwrap(), status);
        }
    }

    fn draft(store: &Store) -> Post {
        let post = Post::draft("u1", crate::Content::text("hi"), vec!["x".into()]);
        store.insert_post(&post).unwrap();
        post
    }

    #[test]
    fn schedule_with_jobs_replaces_pending_jobs() {
        let store = Store::open_in_memory().unwrap();
        let post = draft(&store);
        let first = Utc::now() + Duration::hours(1);
        store
            .schedule_post_with_jobs(&post.id, first, &[job("old", &post.id, first)])
            .unwrap();

        let second = first + Duration::hours(1);
        let scheduled = store
            .schedule_post_with_jobs(&post.id, second, &[job("new", &post.id, second)])
            .unwrap();

        assert_eq!(scheduled.status, PostStatus::Scheduled);
        assert_eq!(
            store.get_job("old").unwrap().unwrap().status,
            JobRecordStatus::Cancelled
        );
        assert_eq!(
            store.get_job("new").unwrap().unwrap().status,
            JobRecordStatus::Pending
        );
    }

    #[test]
    fn failed_job_insert_leaves_post_and_jobs_untouched() {
        let store = Store::open_in_memory().unwrap();
        let post = draft(&store);
        let at = Utc::now() + Duration::hours(1);
        store.insert_job(&job("taken", "other", at)).unwrap();
        store.insert_job(&job("earlier", &post.id, at)).unwrap();

        // the second row collides, so nothing of the schedule may persist
        let result = store.schedule_post_with_jobs(
            &post.id,
            at,
            &[job("publish", &post.id, at), job("taken", &post.id, at)],
        );
        assert!(result.is_err());

        let stored = store.find_post(&post.id).unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Draft);
        assert!(stored.scheduled_for.is_none());
        assert!(store.get_job("publish").unwrap().is_none());
        assert_eq!(
            store.get_job("earlier").unwrap().unwrap().status,
            JobRecordStatus::Pending
        );
    }
}
