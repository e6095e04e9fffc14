//! Unexpected errors inside a run are retried with backoff, then handed to the
//! failure handler.

mod common;

use std::path::Path;
use std::sync::Arc;

use chrono::Duration;
use pretty_assertions::assert_eq;

use common::{Harness, hours_from_now};
use crier_scheduler::JobStatus;
use crier_store::{Content, PostStatus, Store};
use crier_workflow::{GENERIC_FAILURE_REASON, PUBLISH_JOB, WorkflowConfig};

/// Take the overrides table away from the running store, or give it back.
fn overrides_offline(path: &Path, offline: bool) {
    let conn = rusqlite::Connection::open(path).unwrap();
    let sql = if offline {
        "ALTER TABLE post_overrides RENAME TO post_overrides_offline"
    } else {
        "ALTER TABLE post_overrides_offline RENAME TO post_overrides"
    };
    conn.execute_batch(sql).unwrap();
}

fn file_harness(dir: &tempfile::TempDir) -> (Harness, std::path::PathBuf) {
    let path = dir.path().join("crier.db");
    let store = Arc::new(Store::open(&path).unwrap());
    (Harness::with_store(store, WorkflowConfig::default()), path)
}

fn publish_job(h: &Harness, post_id: &str) -> crier_scheduler::Job {
    h.scheduler
        .jobs_for(post_id)
        .unwrap()
        .into_iter()
        .find(|j| j.kind == PUBLISH_JOB)
        .unwrap()
}

#[tokio::test]
async fn storage_errors_exhaust_retries_then_fail_once() {
    let dir = tempfile::tempdir().unwrap();
    let (h, path) = file_harness(&dir);
    h.connect("u1", &["x"]);
    let post = h.draft("u1", &["x"], Content::text("hi"));
    let t = hours_from_now(2);
    h.schedule(&post, t);

    overrides_offline(&path, true);
    let ticks = h.run_until_idle().await;

    // four attempts 30s, 60s and 120s apart, then the watchdog finds nothing to do
    assert_eq!(
        ticks,
        vec![
            t,
            t + Duration::seconds(30),
            t + Duration::seconds(90),
            t + Duration::seconds(210),
            t + Duration::seconds(300),
        ]
    );

    let job = publish_job(&h, &post.id);
    assert_eq!(job.attempts, 4);
    assert!(matches!(job.status, JobStatus::Failed { .. }));

    let stored = h.post(&post.id).unwrap();
    assert_eq!(stored.status, PostStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some(GENERIC_FAILURE_REASON));
    assert!(h.publisher.calls().is_empty());

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].reason, GENERIC_FAILURE_REASON);
}

#[tokio::test]
async fn run_succeeds_once_storage_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let (h, path) = file_harness(&dir);
    h.connect("u1", &["x"]);
    let post = h.draft("u1", &["x"], Content::text("hi"));
    let t = hours_from_now(2);
    h.schedule(&post, t);

    overrides_offline(&path, true);
    h.tick(t).await;
    h.tick(t + Duration::seconds(30)).await;
    assert_eq!(h.post(&post.id).unwrap().status, PostStatus::Scheduled);

    overrides_offline(&path, false);
    let ticks = h.run_until_idle().await;
    assert_eq!(
        ticks,
        vec![t + Duration::seconds(90), t + Duration::seconds(300)]
    );

    let job = publish_job(&h, &post.id);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(h.post(&post.id).unwrap().status, PostStatus::Published);
    assert_eq!(h.publisher.calls_for("x"), 1);
    assert!(h.notifier.sent().is_empty());
}
