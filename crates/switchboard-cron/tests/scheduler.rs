//! Scheduler behaviour against an in-memory runner.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use switchboard_cron::{
    CronJob, CronJobCreate, CronJobRunner, CronRunStatus, CronScheduler, CronStore, JobRunResult,
    RunMode,
};
use switchboard_hooks::HookEngine;

#[derive(Default)]
struct RecordingRunner {
    runs: Mutex<Vec<String>>,
    calls: AtomicUsize,
    fail: bool,
    hang: bool,
}

#[async_trait]
impl CronJobRunner for RecordingRunner {
    async fn run(&self, job: &CronJob, abort: CancellationToken) -> JobRunResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.runs.lock().unwrap().push(job.name.clone());
        if self.hang {
            abort.cancelled().await;
            return JobRunResult::failed("aborted");
        }
        if self.fail {
            JobRunResult::failed("runner exploded")
        } else {
            JobRunResult::ok()
        }
    }
}

fn scheduler(dir: &std::path::Path, runner: Arc<RecordingRunner>) -> Arc<CronScheduler> {
    let store = Arc::new(CronStore::open(&dir.join("jobs.json")).unwrap());
    Arc::new(CronScheduler::new(
        store,
        runner,
        Arc::new(HookEngine::new()),
        2,
    ))
}

fn one_shot_create(name: &str, at: &str, delete_after_run: bool) -> CronJobCreate {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "schedule": { "kind": "at", "at": at },
        "payload": { "kind": "systemEvent", "text": "ping" },
        "deleteAfterRun": delete_after_run,
    }))
    .unwrap()
}

#[tokio::test]
async fn one_shot_success_is_removed_with_delete_after_run() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::default());
    let scheduler = scheduler(dir.path(), Arc::clone(&runner));

    let job = scheduler
        .add(one_shot_create("ping-once", "2025-01-01T00:00:00Z", true))
        .await
        .unwrap();
    // The instant is long past, so the job is due immediately.
    scheduler.tick().await.unwrap();

    assert_eq!(runner.runs.lock().unwrap().as_slice(), ["ping-once"]);
    // deleteAfterRun on success removes the job entirely.
    assert!(scheduler.list().await.is_empty());
    assert!(scheduler.run(&job.id, RunMode::Force).await.is_err());
}

#[tokio::test]
async fn one_shot_without_delete_is_disabled_after_run() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::default());
    let scheduler = scheduler(dir.path(), Arc::clone(&runner));

    scheduler
        .add(one_shot_create("ping-keep", "2025-01-01T00:00:00Z", false))
        .await
        .unwrap();
    scheduler.tick().await.unwrap();

    let jobs = scheduler.list().await;
    assert_eq!(jobs.len(), 1);
    assert!(!jobs[0].enabled);
    assert_eq!(jobs[0].state.last_status, Some(CronRunStatus::Ok));
    assert!(jobs[0].state.next_run_at_ms.is_none());

    // A second tick never re-fires it.
    scheduler.tick().await.unwrap();
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_job_backs_off_instead_of_spinning() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner {
        fail: true,
        ..Default::default()
    });
    let scheduler = scheduler(dir.path(), Arc::clone(&runner));

    scheduler
        .add(
            serde_json::from_value(serde_json::json!({
                "name": "flaky",
                "schedule": { "kind": "every", "everyMs": 10 },
                "payload": { "kind": "systemEvent", "text": "x" },
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    scheduler.tick().await.unwrap();
    let jobs = scheduler.list().await;
    assert_eq!(jobs[0].state.last_status, Some(CronRunStatus::Error));
    assert_eq!(jobs[0].state.consecutive_errors, Some(1));

    // Backoff pushed the next run at least 30 s out.
    let next = jobs[0].state.next_run_at_ms.unwrap();
    let now = chrono::Utc::now().timestamp_millis();
    assert!(next >= now + 25_000, "no backoff applied: {next} vs {now}");

    // Immediately ticking again does nothing — the job is not due.
    scheduler.tick().await.unwrap();
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_job_times_out_with_canonical_error() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner {
        hang: true,
        ..Default::default()
    });
    let scheduler = scheduler(dir.path(), Arc::clone(&runner));

    scheduler
        .add(
            serde_json::from_value(serde_json::json!({
                "name": "slow",
                "schedule": { "kind": "every", "everyMs": 60000 },
                "sessionTarget": "isolated",
                "payload": { "kind": "agentTurn", "message": "work", "timeoutSeconds": 1 },
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    // Make it due now.
    let jobs = scheduler.list().await;
    let result = scheduler.run(&jobs[0].id, RunMode::Force).await.unwrap();
    assert_eq!(result.status, CronRunStatus::Error);
    assert_eq!(result.error.as_deref(), Some("cron: job execution timed out"));
}

#[tokio::test]
async fn manual_run_due_mode_respects_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::default());
    let scheduler = scheduler(dir.path(), Arc::clone(&runner));

    let job = scheduler
        .add(
            serde_json::from_value(serde_json::json!({
                "name": "later",
                "schedule": { "kind": "at", "at": "2099-01-01T00:00:00Z" },
                "payload": { "kind": "systemEvent", "text": "x" },
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    let skipped = scheduler.run(&job.id, RunMode::Due).await.unwrap();
    assert_eq!(skipped.status, CronRunStatus::Skipped);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

    let forced = scheduler.run(&job.id, RunMode::Force).await.unwrap();
    assert_eq!(forced.status, CronRunStatus::Ok);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn store_survives_restart_with_state() {
    let dir = tempfile::tempdir().unwrap();
    {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = scheduler(dir.path(), runner);
        scheduler
            .add(one_shot_create("persist", "2099-01-01T00:00:00Z", false))
            .await
            .unwrap();
    }

    let runner = Arc::new(RecordingRunner::default());
    let scheduler = scheduler(dir.path(), runner);
    let jobs = scheduler.list().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, "persist");
    assert!(jobs[0].enabled);
}
