//! `switchboard-cron` — persistent job scheduling.
//!
//! Jobs live in one JSON store file and fire on three schedule kinds
//! (`at`, `every`, `cron`). The engine arms a single timer bounded at 60 s,
//! marks due jobs running under the store lock, executes them outside it
//! through an injected [`engine::CronJobRunner`], and applies outcomes with
//! error backoff, one-shot disabling, and stuck-run recovery.
//!
//! | Kind | Behaviour |
//! |---|---|
//! | `at` | Single fire at an absolute instant, disabled after any terminal status |
//! | `every` | Anchored fixed interval |
//! | `cron` | 5/6-field expression in a configured timezone, with per-job stagger |

pub mod engine;
pub mod error;
pub mod plan;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{CronJobRunner, CronScheduler, JobRunResult, RunMode};
pub use error::{CronError, Result};
pub use plan::{resolve_cron_delivery_plan, CronDeliveryPlan};
pub use schedule::{compute_next_run, MAX_TIMER_DELAY_MS};
pub use store::CronStore;
pub use types::{
    normalize_cron_job_create, CronDelivery, CronJob, CronJobCreate, CronJobState, CronPayload,
    CronRunStatus, CronSchedule, DeliveryMode, DeliveryStatus, SessionTarget, WakeMode,
};
