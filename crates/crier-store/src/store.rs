//! SQLite-backed content store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::{
    Content, ContentOverride, Post, PostStatus, StoreError, TargetBinding, TargetResult,
    TargetStatus, TerminalUpdate,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        notify_on_failure INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS posts (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        text TEXT NOT NULL,
        media TEXT NOT NULL DEFAULT '[]',
        targets TEXT NOT NULL DEFAULT '[]',
        scheduled_for TEXT,
        status TEXT NOT NULL DEFAULT 'DRAFT',
        published_at TEXT,
        failure_reason TEXT,
        external_ref TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_posts_owner ON posts(owner_id);
    CREATE INDEX IF NOT EXISTS idx_posts_status ON posts(status);

    CREATE TABLE IF NOT EXISTS post_overrides (
        post_id TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
        target TEXT NOT NULL,
        text TEXT NOT NULL,
        media TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (post_id, target)
    );

    CREATE TABLE IF NOT EXISTS target_results (
        post_id TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
        target TEXT NOT NULL,
        text TEXT NOT NULL,
        media TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL,
        external_ref TEXT,
        failure_detail TEXT,
        published_at TEXT,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (post_id, target)
    );

    CREATE TABLE IF NOT EXISTS target_bindings (
        user_id TEXT NOT NULL,
        target TEXT NOT NULL,
        binding_ref TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (user_id, target)
    );

    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        correlation_key TEXT NOT NULL,
        payload TEXT NOT NULL,
        run_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, run_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_correlation ON jobs(correlation_key);

    CREATE TABLE IF NOT EXISTS checkpoints (
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        step TEXT NOT NULL,
        output TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (job_id, step)
    );
";

const POST_COLUMNS: &str = "id, owner_id, text, media, targets, scheduled_for, status, \
     published_at, failure_reason, external_ref, created_at, updated_at";

const RESULT_COLUMNS: &str =
    "post_id, target, text, media, status, external_ref, failure_detail, published_at, updated_at";

/// SQLite-backed store shared by the authoring surface, the workflows and the scheduler.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;

        // WAL for concurrent readers; the busy timeout absorbs short writer contention
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self::init(conn)?;
        info!(path = %path.as_ref().display(), "content store initialized");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Create or update a user's notification preference.
    pub fn upsert_user(&self, user_id: &str, notify_on_failure: bool) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (id, notify_on_failure) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET notify_on_failure = excluded.notify_on_failure",
            params![user_id, notify_on_failure],
        )?;
        Ok(())
    }

    /// Whether the user wants failure notifications. Unknown users default to yes.
    pub fn notify_on_failure(&self, user_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let enabled = conn
            .query_row(
                "SELECT notify_on_failure FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(enabled.unwrap_or(true))
    }

    // =========================================================================
    // Target bindings
    // =========================================================================

    /// Create or replace a binding.
    pub fn upsert_binding(&self, binding: &TargetBinding) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO target_bindings (user_id, target, binding_ref, active)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                binding.user_id,
                binding.target,
                binding.binding_ref,
                binding.active
            ],
        )?;
        Ok(())
    }

    /// Mark a binding inactive (connection revoked). Returns false if it did not exist.
    pub fn deactivate_binding(&self, user_id: &str, target: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE target_bindings SET active = 0 WHERE user_id = ?1 AND target = ?2",
            params![user_id, target],
        )?;
        Ok(changed > 0)
    }

    /// All active bindings for a user.
    pub fn active_bindings(&self, user_id: &str) -> Result<Vec<TargetBinding>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, target, binding_ref, active FROM target_bindings
             WHERE user_id = ?1 AND active = 1 ORDER BY target",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(TargetBinding {
                    user_id: row.get(0)?,
                    target: row.get(1)?,
                    binding_ref: row.get(2)?,
                    active: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Posts
    // =========================================================================

    /// Insert a new post.
    pub fn insert_post(&self, post: &Post) -> Result<(), StoreError> {
        post.validate()?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO posts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                POST_COLUMNS
            ),
            params![
                post.id,
                post.owner_id,
                post.content.text,
                serde_json::to_string(&post.content.media)?,
                serde_json::to_string(&post.targets)?,
                post.scheduled_for.map(fmt_ts),
                post.status.as_str(),
                post.published_at.map(fmt_ts),
                post.failure_reason,
                post.external_ref,
                fmt_ts(post.created_at),
                fmt_ts(post.updated_at),
            ],
        )?;
        debug!(post_id = %post.id, status = %post.status, "inserted post");
        Ok(())
    }

    /// Find a post by id.
    pub fn find_post(&self, id: &str) -> Result<Option<Post>, StoreError> {
        let conn = self.conn()?;
        find_post_in(&conn, id)
    }

    /// Move a draft or scheduled post to `SCHEDULED` at `at`.
    pub fn schedule_post(&self, id: &str, at: DateTime<Utc>) -> Result<Post, StoreError> {
        self.set_schedule(id, Some(at), PostStatus::Scheduled)
    }

    /// Return a scheduled post to `DRAFT`.
    pub fn unschedule_post(&self, id: &str) -> Result<Post, StoreError> {
        self.set_schedule(id, None, PostStatus::Draft)
    }

    fn set_schedule(
        &self,
        id: &str,
        at: Option<DateTime<Utc>>,
        status: PostStatus,
    ) -> Result<Post, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let post = set_schedule_in(&tx, id, at, status)?;
        tx.commit()?;
        Ok(post)
    }

    /// Apply a terminal status, only if the post is still `SCHEDULED`.
    ///
    /// Returns true if this call performed the transition.
    pub fn finalize_post(&self, id: &str, update: &TerminalUpdate) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE posts
             SET status = ?1, published_at = ?2, failure_reason = ?3, external_ref = ?4, updated_at = ?5
             WHERE id = ?6 AND status = 'SCHEDULED'",
            params![
                update.status.as_str(),
                update.published_at.map(fmt_ts),
                update.failure_reason,
                update.external_ref,
                fmt_ts(Utc::now()),
                id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Delete a draft or scheduled post along with its overrides and results.
    ///
    /// Returns the deleted post, or `None` if it did not exist.
    pub fn delete_post(&self, id: &str) -> Result<Option<Post>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let Some(post) = find_post_in(&tx, id)? else {
            return Ok(None);
        };
        if post.status.is_terminal() {
            return Err(StoreError::Immutable {
                id: id.to_string(),
                status: post.status,
            });
        }

        tx.execute("DELETE FROM post_overrides WHERE post_id = ?1", params![id])?;
        tx.execute("DELETE FROM target_results WHERE post_id = ?1", params![id])?;
        tx.execute("DELETE FROM posts WHERE id = ?1", params![id])?;
        tx.commit()?;

        debug!(post_id = %id, "deleted post");
        Ok(Some(post))
    }

    // =========================================================================
    // Overrides
    // =========================================================================

    /// Create or replace the override for (post, target).
    pub fn upsert_override(&self, over: &ContentOverride) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let post = find_post_in(&conn, &over.post_id)?
            .ok_or_else(|| StoreError::PostNotFound(over.post_id.clone()))?;
        if post.status.is_terminal() {
            return Err(StoreError::Immutable {
                id: post.id,
                status: post.status,
            });
        }

        conn.execute(
            "INSERT OR REPLACE INTO post_overrides (post_id, target, text, media)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                over.post_id,
                over.target,
                over.content.text,
                serde_json::to_string(&over.content.media)?,
            ],
        )?;
        Ok(())
    }

    /// All overrides for a post.
    pub fn overrides_for(&self, post_id: &str) -> Result<Vec<ContentOverride>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT post_id, target, text, media FROM post_overrides WHERE post_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![post_id], |row| {
                Ok(ContentOverride {
                    post_id: row.get(0)?,
                    target: row.get(1)?,
                    content: Content {
                        text: row.get(2)?,
                        media: get_json(row, 3)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Per-target results
    // =========================================================================

    /// Upsert the result for (post, target).
    ///
    /// Returns false without writing if the post no longer exists.
    pub fn upsert_target_result(&self, result: &TargetResult) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let written = conn.execute(
            &format!(
                "INSERT OR REPLACE INTO target_results ({})
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
                 WHERE EXISTS (SELECT 1 FROM posts WHERE id = ?1)",
                RESULT_COLUMNS
            ),
            params![
                result.post_id,
                result.target,
                result.content.text,
                serde_json::to_string(&result.content.media)?,
                result.status.as_str(),
                result.external_ref,
                result.failure_detail,
                result.published_at.map(fmt_ts),
                fmt_ts(result.updated_at),
            ],
        )?;
        Ok(written > 0)
    }

    /// The result for (post, target), if any.
    pub fn target_result(
        &self,
        post_id: &str,
        target: &str,
    ) -> Result<Option<TargetResult>, StoreError> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM target_results WHERE post_id = ?1 AND target = ?2",
                    RESULT_COLUMNS
                ),
                params![post_id, target],
                target_result_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// All results for a post, in no particular order.
    pub fn target_results(&self, post_id: &str) -> Result<Vec<TargetResult>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM target_results WHERE post_id = ?1",
            RESULT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![post_id], target_result_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub(crate) fn set_schedule_in(
    conn: &Connection,
    id: &str,
    at: Option<DateTime<Utc>>,
    status: PostStatus,
) -> Result<Post, StoreError> {
    let mut post =
        find_post_in(conn, id)?.ok_or_else(|| StoreError::PostNotFound(id.to_string()))?;
    if post.status.is_terminal() {
        return Err(StoreError::Immutable {
            id: id.to_string(),
            status: post.status,
        });
    }

    let now = Utc::now();
    conn.execute(
        "UPDATE posts SET scheduled_for = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
        params![at.map(fmt_ts), status.as_str(), fmt_ts(now), id],
    )?;

    post.scheduled_for = at;
    post.status = status;
    post.updated_at = now;
    Ok(post)
}

fn find_post_in(conn: &Connection, id: &str) -> Result<Option<Post>, StoreError> {
    let post = conn
        .query_row(
            &format!("SELECT {} FROM posts WHERE id = ?1", POST_COLUMNS),
            params![id],
            |row| {
                Ok(Post {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    content: Content {
                        text: row.get(2)?,
                        media: get_json(row, 3)?,
                    },
                    targets: get_json(row, 4)?,
                    scheduled_for: get_opt_ts(row, 5)?,
                    status: get_parsed(row, 6)?,
                    published_at: get_opt_ts(row, 7)?,
                    failure_reason: row.get(8)?,
                    external_ref: row.get(9)?,
                    created_at: get_ts(row, 10)?,
                    updated_at: get_ts(row, 11)?,
                })
            },
        )
        .optional()?;
    Ok(post)
}

fn target_result_from_row(row: &Row<'_>) -> rusqlite::Result<TargetResult> {
    Ok(TargetResult {
        post_id: row.get(0)?,
        target: row.get(1)?,
        content: Content {
            text: row.get(2)?,
            media: get_json(row, 3)?,
        },
        status: get_parsed::<TargetStatus>(row, 4)?,
        external_ref: row.get(5)?,
        failure_detail: row.get(6)?,
        published_at: get_opt_ts(row, 7)?,
        updated_at: get_ts(row, 8)?,
    })
}

// =========================================================================
// Column helpers
// =========================================================================

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn get_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = StoreError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_with_post(targets: &[&str]) -> (Store, Post) {
        let store = Store::open_in_memory().unwrap();
        let post = Post::draft(
            "user-1",
            Content::new("hello", vec!["media/1.png".into()]),
            targets.iter().map(|t| t.to_string()).collect(),
        );
        store.insert_post(&post).unwrap();
        (store, post)
    }

    #[test]
    fn insert_and_find_round_trip() {
        let (store, post) = store_with_post(&["tiktok", "instagram"]);
        let found = store.find_post(&post.id).unwrap().unwrap();
        assert_eq!(found.targets, vec!["tiktok", "instagram"]);
        assert_eq!(found.content, post.content);
        assert_eq!(found.status, PostStatus::Draft);
        assert!(found.scheduled_for.is_none());
    }

    #[test]
    fn find_missing_post_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.find_post("nope").unwrap().is_none());
    }

    #[test]
    fn finalize_only_applies_to_scheduled_posts() {
        let (store, post) = store_with_post(&["x"]);

        // Drafts are not finalized
        assert!(!store
            .finalize_post(&post.id, &TerminalUpdate::failed("nope"))
            .unwrap());

        store
            .schedule_post(&post.id, Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        let at = Utc::now();
        assert!(store
            .finalize_post(&post.id, &TerminalUpdate::published(at, Some("ext".into())))
            .unwrap());

        // Second terminal write loses
        assert!(!store
            .finalize_post(&post.id, &TerminalUpdate::failed("late"))
            .unwrap());

        let found = store.find_post(&post.id).unwrap().unwrap();
        assert_eq!(found.status, PostStatus::Published);
        assert_eq!(found.external_ref.as_deref(), Some("ext"));
        assert!(found.failure_reason.is_none());
    }

    #[test]
    fn terminal_posts_cannot_be_deleted_or_rescheduled() {
        let (store, post) = store_with_post(&["x"]);
        store
            .schedule_post(&post.id, Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        store
            .finalize_post(&post.id, &TerminalUpdate::failed("all failed"))
            .unwrap();

        assert!(matches!(
            store.delete_post(&post.id),
            Err(StoreError::Immutable { .. })
        ));
        assert!(matches!(
            store.schedule_post(&post.id, Utc::now()),
            Err(StoreError::Immutable { .. })
        ));
    }

    #[test]
    fn delete_removes_overrides_and_results() {
        let (store, post) = store_with_post(&["x"]);
        store
            .upsert_override(&ContentOverride {
                post_id: post.id.clone(),
                target: "x".into(),
                content: Content::text("override"),
            })
            .unwrap();
        store
            .upsert_target_result(&TargetResult::pending(&post.id, "x", Content::text("t")))
            .unwrap();

        let deleted = store.delete_post(&post.id).unwrap();
        assert_eq!(deleted.map(|p| p.id), Some(post.id.clone()));
        assert!(store.overrides_for(&post.id).unwrap().is_empty());
        assert!(store.target_results(&post.id).unwrap().is_empty());
        assert!(store.delete_post(&post.id).unwrap().is_none());
    }

    #[test]
    fn target_result_upsert_is_keyed() {
        let (store, post) = store_with_post(&["x"]);
        let pending = TargetResult::pending(&post.id, "x", Content::text("t"));
        store.upsert_target_result(&pending).unwrap();
        store.upsert_target_result(&pending).unwrap();
        store
            .upsert_target_result(&pending.clone().failed("HTTP 500: boom".into()))
            .unwrap();

        let results = store.target_results(&post.id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TargetStatus::Failed);
        assert_eq!(results[0].failure_detail.as_deref(), Some("HTTP 500: boom"));
    }

    #[test]
    fn target_result_for_deleted_post_is_dropped() {
        let (store, post) = store_with_post(&["x"]);
        store.delete_post(&post.id).unwrap();

        let written = store
            .upsert_target_result(&TargetResult::pending(&post.id, "x", Content::text("t")))
            .unwrap();
        assert!(!written);
        assert!(store.target_results(&post.id).unwrap().is_empty());
    }

    #[test]
    fn inactive_bindings_are_excluded() {
        let store = Store::open_in_memory().unwrap();
        for target in ["tiktok", "instagram"] {
            store
                .upsert_binding(&TargetBinding {
                    user_id: "u1".into(),
                    target: target.into(),
                    binding_ref: format!("ref-{}", target),
                    active: true,
                })
                .unwrap();
        }
        assert!(store.deactivate_binding("u1", "tiktok").unwrap());
        assert!(!store.deactivate_binding("u1", "youtube").unwrap());

        let active = store.active_bindings("u1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].target, "instagram");
    }

    #[test]
    fn notification_preference_defaults_on() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.notify_on_failure("stranger").unwrap());
        store.upsert_user("quiet", false).unwrap();
        assert!(!store.notify_on_failure("quiet").unwrap());
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(1);
        assert!(fmt_ts(early) < fmt_ts(late));
    }
}
