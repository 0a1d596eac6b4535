use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use switchboard_core::agent::DEFAULT_TURN_TIMEOUT_SECS;
use switchboard_core::types::now_ms;
use switchboard_hooks::{HookContext, HookEngine, HookEvent};

use crate::error::{CronError, Result};
use crate::schedule::{
    compute_next_run, ERROR_BACKOFF_MS, MAX_SCHEDULE_ERRORS, MAX_TIMER_DELAY_MS,
    MIN_CRON_REFIRE_GAP_MS,
};
use crate::store::{clear_stale_running, CronStore};
use crate::types::{
    normalize_cron_job_create, CronJob, CronJobCreate, CronPayload, CronRunStatus, CronSchedule,
    DeliveryStatus,
};

/// What an execution reported back.
#[derive(Debug, Clone)]
pub struct JobRunResult {
    pub status: CronRunStatus,
    pub error: Option<String>,
    pub delivered: Option<bool>,
    pub delivery_status: Option<DeliveryStatus>,
    pub delivery_error: Option<String>,
}

impl JobRunResult {
    pub fn ok() -> Self {
        Self {
            status: CronRunStatus::Ok,
            error: None,
            delivered: None,
            delivery_status: None,
            delivery_error: None,
        }
    }

    pub fn skipped(reason: &str) -> Self {
        Self {
            status: CronRunStatus::Skipped,
            error: Some(reason.to_string()),
            delivered: None,
            delivery_status: None,
            delivery_error: None,
        }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            status: CronRunStatus::Error,
            error: Some(message.to_string()),
            delivered: None,
            delivery_status: None,
            delivery_error: None,
        }
    }
}

/// Executes one job outside the store lock. The gateway implements this by
/// enqueueing system events or driving isolated agent turns.
#[async_trait]
pub trait CronJobRunner: Send + Sync {
    async fn run(&self, job: &CronJob, abort: CancellationToken) -> JobRunResult;
}

/// Manual-run gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run only if the job is actually due.
    Due,
    /// Run regardless of schedule.
    Force,
}

/// The scheduler: one timer, due-job selection under the store lock,
/// execution outside it, and outcome application with backoff.
pub struct CronScheduler {
    store: Arc<CronStore>,
    runner: Arc<dyn CronJobRunner>,
    hooks: Arc<HookEngine>,
    max_concurrent_runs: usize,
    shutdown: CancellationToken,
    wake: Notify,
    ticking: AtomicBool,
}

impl CronScheduler {
    pub fn new(
        store: Arc<CronStore>,
        runner: Arc<dyn CronJobRunner>,
        hooks: Arc<HookEngine>,
        max_concurrent_runs: usize,
    ) -> Self {
        Self {
            store,
            runner,
            hooks,
            max_concurrent_runs: max_concurrent_runs.max(1),
            shutdown: CancellationToken::new(),
            wake: Notify::new(),
            ticking: AtomicBool::new(false),
        }
    }

    /// Start the scheduler: catch up missed jobs, then run the timer loop
    /// until [`stop`](Self::stop).
    pub async fn start(self: Arc<Self>) -> Result<()> {
        // Catch-up: anything past-due (and not terminal) fires immediately.
        self.recompute_all().await?;
        self.tick().await?;

        let scheduler = Arc::clone(&self);
        tokio::spawn(async move {
            info!("cron scheduler started");
            loop {
                let delay = scheduler.next_delay().await;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = scheduler.wake.notified() => {
                        debug!("cron scheduler woken");
                    }
                    _ = scheduler.shutdown.cancelled() => {
                        info!("cron scheduler shutting down");
                        break;
                    }
                }
                if let Err(e) = scheduler.tick().await {
                    error!(error = %e, "cron tick failed");
                }
            }
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Nudge the timer (a job was added or `wake_mode=now` fired).
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    // ── CRUD ──────────────────────────────────────────────────────────────────

    pub async fn add(&self, create: CronJobCreate) -> Result<CronJob> {
        let mut job = normalize_cron_job_create(create)?;
        job.state.next_run_at_ms = compute_next_run(&job, now_ms())?;
        let stored = job.clone();
        self.store.with_jobs(move |jobs| jobs.push(job)).await?;
        info!(job_id = %stored.id, name = %stored.name, "cron job added");
        self.wake();
        Ok(stored)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let removed = self
            .store
            .with_jobs(|jobs| {
                let before = jobs.len();
                jobs.retain(|j| j.id != id);
                before != jobs.len()
            })
            .await?;
        if !removed {
            return Err(CronError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "cron job removed");
        self.emit_removed(id);
        Ok(())
    }

    pub async fn list(&self) -> Vec<CronJob> {
        self.store.snapshot().await
    }

    /// Enable/disable or edit a job; the next run is recomputed.
    pub async fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut CronJob) + Send,
    ) -> Result<CronJob> {
        let wanted = id.to_string();
        let updated = self
            .store
            .with_jobs(move |jobs| {
                let job = jobs.iter_mut().find(|j| j.id == wanted)?;
                mutate(job);
                job.updated_at_ms = now_ms();
                match compute_next_run(job, now_ms()) {
                    Ok(next) => job.state.next_run_at_ms = next,
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "schedule recompute failed on update");
                    }
                }
                Some(job.clone())
            })
            .await?;
        let job = updated.ok_or_else(|| CronError::JobNotFound { id: id.to_string() })?;
        self.wake();
        Ok(job)
    }

    /// Manual run. Reserves the running marker under the lock, executes
    /// outside it, applies the outcome; other jobs that became due while the
    /// run was in flight are not advanced past their slot.
    pub async fn run(&self, id: &str, mode: RunMode) -> Result<JobRunResult> {
        let now = now_ms();
        let id_owned = id.to_string();
        let reserved = self
            .store
            .with_jobs(move |jobs| {
                let Some(job) = jobs.iter_mut().find(|j| j.id == id_owned) else {
                    return Reservation::Missing;
                };
                if job.state.running_at_ms.is_some() {
                    return Reservation::Busy;
                }
                if mode == RunMode::Due
                    && !job
                        .state
                        .next_run_at_ms
                        .map(|t| t <= now)
                        .unwrap_or(false)
                {
                    return Reservation::NotDue;
                }
                job.state.running_at_ms = Some(now);
                Reservation::Reserved(Box::new(job.clone()))
            })
            .await?;

        let job = match reserved {
            Reservation::Missing => {
                return Err(CronError::JobNotFound { id: id.to_string() })
            }
            Reservation::Busy => return Ok(JobRunResult::skipped("already running")),
            Reservation::NotDue => return Ok(JobRunResult::skipped("not due")),
            Reservation::Reserved(job) => *job,
        };

        let execution = execute_job(Arc::clone(&self.runner), job).await;
        let result = execution.result.clone();
        self.apply_executions(vec![execution]).await?;
        Ok(result)
    }

    // ── Tick machinery ────────────────────────────────────────────────────────

    async fn next_delay(&self) -> Duration {
        let now = now_ms();
        let earliest = self
            .store
            .snapshot()
            .await
            .iter()
            .filter(|j| j.enabled && j.state.running_at_ms.is_none())
            .filter_map(|j| j.state.next_run_at_ms)
            .min();

        let wait = earliest
            .map(|t| (t - now).clamp(0, MAX_TIMER_DELAY_MS))
            .unwrap_or(MAX_TIMER_DELAY_MS);
        Duration::from_millis(wait as u64)
    }

    /// One scheduler pass. Re-entrant calls (a tick arriving while one is
    /// running) return immediately — the loop's next arm acts as watchdog.
    pub async fn tick(&self) -> Result<()> {
        if self.ticking.swap(true, Ordering::SeqCst) {
            debug!("tick skipped, previous still running");
            return Ok(());
        }
        let outcome = self.tick_inner().await;
        self.ticking.store(false, Ordering::SeqCst);
        outcome
    }

    async fn tick_inner(&self) -> Result<()> {
        let now = now_ms();

        // Select + mark due jobs under the lock.
        let due: Vec<CronJob> = self
            .store
            .with_jobs(|jobs| {
                clear_stale_running(jobs, now);
                let mut due = Vec::new();
                for job in jobs.iter_mut() {
                    if job.enabled
                        && job.state.running_at_ms.is_none()
                        && job.state.next_run_at_ms.map(|t| t <= now).unwrap_or(false)
                    {
                        job.state.running_at_ms = Some(now);
                        due.push(job.clone());
                    }
                }
                due
            })
            .await?;

        if due.is_empty() {
            return Ok(());
        }
        info!(count = due.len(), "cron tick executing due jobs");

        // Execute outside the lock, bounded by max_concurrent_runs.
        let mut queue = due.into_iter();
        let mut set: JoinSet<Execution> = JoinSet::new();
        let mut executions = Vec::new();

        loop {
            while set.len() < self.max_concurrent_runs {
                match queue.next() {
                    Some(job) => {
                        let runner = Arc::clone(&self.runner);
                        set.spawn(execute_job(runner, job));
                    }
                    None => break,
                }
            }
            match set.join_next().await {
                Some(Ok(execution)) => executions.push(execution),
                Some(Err(e)) => error!(error = %e, "cron execution task panicked"),
                None => break,
            }
        }

        self.apply_executions(executions).await
    }

    /// Reacquire the lock and fold run outcomes back into the store.
    async fn apply_executions(&self, executions: Vec<Execution>) -> Result<()> {
        let completed: Vec<(CronJob, JobRunResult)> = self
            .store
            .with_jobs(|jobs| {
                let now = now_ms();
                let mut completed = Vec::new();

                for execution in executions {
                    let Some(index) = jobs.iter().position(|j| j.id == execution.job_id) else {
                        continue;
                    };
                    let remove = apply_job_result(
                        &mut jobs[index],
                        execution.started_at,
                        execution.ended_at,
                        &execution.result,
                    );
                    completed.push((jobs[index].clone(), execution.result));
                    if remove {
                        jobs.remove(index);
                    }
                }

                recompute_next_runs_for_maintenance(jobs, now);
                completed
            })
            .await?;

        for (job, result) in completed {
            self.hooks.emit_after(
                HookContext::new(
                    HookEvent::CronJobCompleted,
                    json!({
                        "jobId": job.id,
                        "name": job.name,
                        "status": result.status,
                        "error": result.error,
                    }),
                )
                .with_session(job.session_key.clone().unwrap_or_default()),
            );
            if job.delete_after_run.unwrap_or(false) && result.status == CronRunStatus::Ok {
                self.emit_removed(&job.id);
            }
        }
        Ok(())
    }

    async fn recompute_all(&self) -> Result<()> {
        self.store
            .with_jobs(|jobs| {
                let now = now_ms();
                recompute_next_runs_for_maintenance(jobs, now);
            })
            .await
    }

    fn emit_removed(&self, job_id: &str) {
        self.hooks.emit_after(HookContext::new(
            HookEvent::CronJobRemoved,
            json!({ "jobId": job_id }),
        ));
    }
}

enum Reservation {
    Missing,
    Busy,
    NotDue,
    Reserved(Box<CronJob>),
}

struct Execution {
    job_id: String,
    started_at: i64,
    ended_at: i64,
    result: JobRunResult,
}

/// Run one job with its timeout; a timeout aborts the run via the token and
/// records the canonical timeout error.
async fn execute_job(runner: Arc<dyn CronJobRunner>, job: CronJob) -> Execution {
    let timeout_secs = match &job.payload {
        CronPayload::AgentTurn { timeout_seconds, .. } => {
            timeout_seconds.unwrap_or(DEFAULT_TURN_TIMEOUT_SECS)
        }
        CronPayload::SystemEvent { .. } => DEFAULT_TURN_TIMEOUT_SECS,
    };

    let abort = CancellationToken::new();
    let started_at = now_ms();
    let result = match tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        runner.run(&job, abort.clone()),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            abort.cancel();
            JobRunResult::failed("cron: job execution timed out")
        }
    };

    Execution {
        job_id: job.id,
        started_at,
        ended_at: now_ms(),
        result,
    }
}

/// Fold a run outcome into the job state. Returns `true` when the job should
/// be removed from the store (`delete_after_run` after success).
fn apply_job_result(
    job: &mut CronJob,
    started_at: i64,
    ended_at: i64,
    result: &JobRunResult,
) -> bool {
    let state = &mut job.state;
    state.running_at_ms = None;
    state.last_run_at_ms = Some(started_at);
    state.last_status = Some(result.status);
    state.last_error = result.error.clone();
    state.last_duration_ms = Some(ended_at - started_at);
    state.last_delivered = result.delivered;
    state.last_delivery_status = result.delivery_status;
    state.last_delivery_error = result.delivery_error.clone();
    job.updated_at_ms = ended_at;

    state.consecutive_errors = match result.status {
        CronRunStatus::Error => Some(state.consecutive_errors.unwrap_or(0) + 1),
        _ => Some(0),
    };

    // Natural next fire, with schedule-error accounting.
    let natural = match compute_next_run(job, ended_at) {
        Ok(next) => {
            job.state.schedule_error_count = Some(0);
            next
        }
        Err(e) => {
            let count = job.state.schedule_error_count.unwrap_or(0) + 1;
            job.state.schedule_error_count = Some(count);
            warn!(job_id = %job.id, error = %e, count, "schedule computation failed");
            if count >= MAX_SCHEDULE_ERRORS {
                error!(job_id = %job.id, "auto-disabling job after repeated schedule errors");
                job.enabled = false;
            }
            None
        }
    };

    let mut next = natural;

    // Error backoff: delay the natural slot, never pull it earlier.
    if result.status == CronRunStatus::Error {
        let errors = job.state.consecutive_errors.unwrap_or(1);
        let slot = ((errors - 1) as usize).min(ERROR_BACKOFF_MS.len() - 1);
        let backed_off = ended_at + ERROR_BACKOFF_MS[slot];
        next = Some(next.map_or(backed_off, |n| n.max(backed_off)));
    }

    // Same-second spin defence for cron expressions.
    if matches!(job.schedule, CronSchedule::Cron { .. }) {
        if let Some(n) = next {
            next = Some(n.max(ended_at + MIN_CRON_REFIRE_GAP_MS));
        }
    }

    // One-shot: any terminal status disables; success may also delete.
    if matches!(job.schedule, CronSchedule::At { .. }) {
        job.enabled = false;
        if result.status == CronRunStatus::Ok {
            next = None;
            if job.delete_after_run.unwrap_or(false) {
                job.state.next_run_at_ms = None;
                return true;
            }
        }
    }

    job.state.next_run_at_ms = next;
    false
}

/// Recompute next-run times for idle jobs, leaving past-due values alone.
///
/// A value already in the past means the job missed its slot (the process was
/// down or a run overshot); advancing it here would silently skip the fire,
/// so it stays put and the next tick picks it up.
fn recompute_next_runs_for_maintenance(jobs: &mut Vec<CronJob>, now: i64) {
    let mut disabled: Vec<String> = Vec::new();

    for job in jobs.iter_mut() {
        if !job.enabled || job.state.running_at_ms.is_some() {
            continue;
        }
        if let Some(existing) = job.state.next_run_at_ms {
            if existing <= now {
                continue;
            }
        }
        match compute_next_run(job, now) {
            Ok(next) => {
                job.state.schedule_error_count = Some(0);
                // A stored future slot may be an error-backoff floor; the
                // natural slot never pulls it earlier.
                job.state.next_run_at_ms = match (next, job.state.next_run_at_ms) {
                    (Some(natural), Some(existing)) => Some(natural.max(existing)),
                    (computed, _) => computed,
                };
            }
            Err(e) => {
                let count = job.state.schedule_error_count.unwrap_or(0) + 1;
                job.state.schedule_error_count = Some(count);
                warn!(job_id = %job.id, error = %e, count, "maintenance schedule recompute failed");
                if count >= MAX_SCHEDULE_ERRORS {
                    job.enabled = false;
                    disabled.push(job.id.clone());
                }
            }
        }
    }

    for id in disabled {
        error!(job_id = %id, "auto-disabled after repeated schedule errors");
    }
}
