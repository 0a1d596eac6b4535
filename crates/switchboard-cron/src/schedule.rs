//! Next-run computation for the three schedule kinds.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use croner::Cron;

use crate::error::{CronError, Result};
use crate::types::{parse_iso_ms, CronJob, CronRunStatus, CronSchedule};

/// The engine's single timer never sleeps longer than this; a long-idle
/// store still gets a watchdog tick every minute.
pub const MAX_TIMER_DELAY_MS: i64 = 60_000;

/// Cron-kind jobs never re-fire within this gap of the previous run, even if
/// the expression matches again (same-second spin-loop defence).
pub const MIN_CRON_REFIRE_GAP_MS: i64 = 2_000;

/// `running_at_ms` markers older than this are considered stuck and cleared.
pub const STUCK_RUN_MS: i64 = 2 * 60 * 60 * 1000;

/// Backoff ladder applied after consecutive run errors.
pub const ERROR_BACKOFF_MS: [i64; 5] = [30_000, 60_000, 300_000, 900_000, 3_600_000];

/// Consecutive schedule-computation failures before a job is auto-disabled.
pub const MAX_SCHEDULE_ERRORS: u32 = 3;

/// Stagger default for daily-or-slower cron expressions.
const DEFAULT_DAILY_STAGGER_MS: i64 = 60_000;

/// Compute the next fire time for `job` strictly from schedule + state.
///
/// Returns `Ok(None)` when the schedule is exhausted (an `at` job that
/// already succeeded).
pub fn compute_next_run(job: &CronJob, now: i64) -> Result<Option<i64>> {
    match &job.schedule {
        CronSchedule::At { at } => {
            // One-shot: pending until the first "ok" terminal status.
            if job.state.last_status == Some(CronRunStatus::Ok) {
                return Ok(None);
            }
            Ok(Some(parse_iso_ms(at)?))
        }

        CronSchedule::Every { every_ms, anchor_ms } => {
            let every = *every_ms;
            if every <= 0 {
                return Err(CronError::ScheduleComputation(
                    "everyMs must be positive".to_string(),
                ));
            }
            if let Some(last) = job.state.last_run_at_ms {
                if last + every > now {
                    return Ok(Some(last + every));
                }
            }
            let anchor = anchor_ms.unwrap_or(job.created_at_ms);
            if now <= anchor {
                return Ok(Some(anchor));
            }
            let elapsed = now - anchor;
            let periods = elapsed / every + i64::from(elapsed % every != 0);
            Ok(Some(anchor + periods * every))
        }

        CronSchedule::Cron { expr, tz, stagger_ms } => {
            let cron: Cron = expr.parse().map_err(|e| {
                CronError::ScheduleComputation(format!("bad cron expression {expr:?}: {e}"))
            })?;

            let stagger = effective_stagger(job, expr, *stagger_ms);
            // Evaluate from (now - stagger) so a match that lands inside the
            // stagger window still fires at match + stagger.
            let from_ms = now - stagger;

            let next_ms = match tz.as_deref().and_then(|t| t.parse::<Tz>().ok()) {
                Some(zone) => {
                    let from = zone
                        .timestamp_millis_opt(from_ms)
                        .single()
                        .unwrap_or_else(|| Utc.timestamp_millis_opt(from_ms).unwrap().with_timezone(&zone));
                    cron.find_next_occurrence(&from, false)
                        .map_err(|e| {
                            CronError::ScheduleComputation(format!(
                                "no next occurrence for {expr:?}: {e}"
                            ))
                        })?
                        .timestamp_millis()
                }
                None => {
                    let from: DateTime<Utc> = Utc.timestamp_millis_opt(from_ms).unwrap();
                    cron.find_next_occurrence(&from, false)
                        .map_err(|e| {
                            CronError::ScheduleComputation(format!(
                                "no next occurrence for {expr:?}: {e}"
                            ))
                        })?
                        .timestamp_millis()
                }
            };

            Ok(Some(next_ms + stagger))
        }
    }
}

/// Stable per-job stagger: `hash(jobId) mod staggerMs`, defaulting to a
/// 60 s window for daily-or-slower expressions so identical crontabs spread
/// out instead of firing in lockstep.
fn effective_stagger(job: &CronJob, expr: &str, stagger_ms: Option<i64>) -> i64 {
    let window = stagger_ms.unwrap_or(if is_daily_or_slower(expr) {
        DEFAULT_DAILY_STAGGER_MS
    } else {
        0
    });
    if window <= 0 {
        return 0;
    }
    (fnv1a(job.id.as_bytes()) % window as u64) as i64
}

/// A 5/6-field expression fires at most daily when both the minute and hour
/// fields are literal values.
fn is_daily_or_slower(expr: &str) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let (minute, hour) = match fields.len() {
        5 => (fields[0], fields[1]),
        6 => (fields[1], fields[2]),
        _ => return false,
    };
    let literal = |f: &str| !f.contains('*') && !f.contains('/') && !f.contains(',') && !f.contains('-');
    literal(minute) && literal(hour)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CronJobState, CronPayload, SessionTarget, WakeMode};

    fn job_with(schedule: CronSchedule) -> CronJob {
        CronJob {
            id: "11111111-2222-3333-4444-555555555555".into(),
            agent_id: None,
            session_key: None,
            name: "t".into(),
            description: None,
            enabled: true,
            delete_after_run: None,
            created_at_ms: 1_000_000,
            updated_at_ms: 1_000_000,
            schedule,
            session_target: SessionTarget::Main,
            wake_mode: WakeMode::NextHeartbeat,
            payload: CronPayload::SystemEvent { text: "x".into() },
            delivery: None,
            state: CronJobState::default(),
        }
    }

    #[test]
    fn at_pending_until_ok_then_exhausted() {
        let mut job = job_with(CronSchedule::At {
            at: "2025-01-01T00:00:00Z".into(),
        });
        let at_ms = 1735689600000;
        assert_eq!(compute_next_run(&job, at_ms + 10_000).unwrap(), Some(at_ms));

        job.state.last_status = Some(CronRunStatus::Ok);
        assert_eq!(compute_next_run(&job, at_ms + 10_000).unwrap(), None);
    }

    #[test]
    fn every_is_anchor_aligned() {
        let job = job_with(CronSchedule::Every {
            every_ms: 10_000,
            anchor_ms: Some(0),
        });
        // now = 25s → next boundary is 30s.
        assert_eq!(compute_next_run(&job, 25_000).unwrap(), Some(30_000));
        // Exactly on a boundary stays put.
        assert_eq!(compute_next_run(&job, 30_000).unwrap(), Some(30_000));
    }

    #[test]
    fn every_prefers_last_run_when_fresh() {
        let mut job = job_with(CronSchedule::Every {
            every_ms: 10_000,
            anchor_ms: Some(0),
        });
        job.state.last_run_at_ms = Some(24_000);
        assert_eq!(compute_next_run(&job, 25_000).unwrap(), Some(34_000));
    }

    #[test]
    fn cron_expression_advances_with_stagger() {
        let job = job_with(CronSchedule::Cron {
            expr: "0 9 * * *".into(),
            tz: Some("UTC".into()),
            stagger_ms: None,
        });
        // 2025-06-01 00:00 UTC → next 09:00 the same day, plus stagger < 60 s.
        let midnight = chrono::Utc
            .with_ymd_and_hms(2025, 6, 1, 0, 0, 0)
            .unwrap()
            .timestamp_millis();
        let nine = chrono::Utc
            .with_ymd_and_hms(2025, 6, 1, 9, 0, 0)
            .unwrap()
            .timestamp_millis();
        let next = compute_next_run(&job, midnight).unwrap().unwrap();
        assert!(next >= nine, "fired before 09:00");
        assert!(next < nine + DEFAULT_DAILY_STAGGER_MS, "stagger exceeded window");
    }

    #[test]
    fn stagger_is_stable_per_job() {
        let job = job_with(CronSchedule::Cron {
            expr: "0 9 * * *".into(),
            tz: Some("UTC".into()),
            stagger_ms: None,
        });
        let now = chrono::Utc
            .with_ymd_and_hms(2025, 6, 1, 0, 0, 0)
            .unwrap()
            .timestamp_millis();
        let a = compute_next_run(&job, now).unwrap();
        let b = compute_next_run(&job, now).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn frequent_cron_gets_no_default_stagger() {
        assert!(!is_daily_or_slower("*/5 * * * *"));
        assert!(!is_daily_or_slower("0 * * * *"));
        assert!(is_daily_or_slower("30 9 * * *"));
        assert!(is_daily_or_slower("0 0 30 9 * *"));
    }

    #[test]
    fn bad_expression_is_schedule_error() {
        let job = job_with(CronSchedule::Cron {
            expr: "not a cron".into(),
            tz: None,
            stagger_ms: None,
        });
        let err = compute_next_run(&job, 1_000_000).unwrap_err();
        assert_eq!(err.code(), "SCHEDULE_COMPUTATION_ERROR");
    }
}
