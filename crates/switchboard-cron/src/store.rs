use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use switchboard_core::types::now_ms;

use crate::error::{CronError, Result};
use crate::schedule::STUCK_RUN_MS;
use crate::types::CronJob;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CronStoreFile {
    jobs: Vec<CronJob>,
}

/// JSON-file-backed job store.
///
/// The in-memory list is the working copy; every mutation happens under the
/// store lock and persists atomically (temp file + rename) before the lock is
/// released. Job executions never hold the lock.
pub struct CronStore {
    path: PathBuf,
    jobs: Mutex<Vec<CronJob>>,
}

impl CronStore {
    /// Load the store, clearing stale `running_at_ms` markers (a crashed
    /// process never cleared them) before anything else sees the jobs.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<CronStoreFile>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CronStoreFile::default(),
            Err(e) => {
                return Err(CronError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        let cleared = clear_stale_running(&mut file.jobs, now_ms());
        let store = Self {
            path: path.to_path_buf(),
            jobs: Mutex::new(file.jobs),
        };
        if cleared > 0 {
            warn!(count = cleared, "cleared stale running markers on startup");
            let jobs = store.jobs.try_lock().expect("fresh store lock");
            store.persist(&jobs)?;
        }
        Ok(store)
    }

    /// Mutate the job list under the lock, persisting before release.
    pub async fn with_jobs<R>(&self, mutate: impl FnOnce(&mut Vec<CronJob>) -> R) -> Result<R> {
        let mut jobs = self.jobs.lock().await;
        let result = mutate(&mut jobs);
        self.persist(&jobs)?;
        Ok(result)
    }

    /// Read-only snapshot of all jobs.
    pub async fn snapshot(&self) -> Vec<CronJob> {
        self.jobs.lock().await.clone()
    }

    fn persist(&self, jobs: &[CronJob]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CronError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let file = CronStoreFile {
            jobs: jobs.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| CronError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CronError::Io {
            path: self.path.display().to_string(),
            source: e,
        })
    }
}

/// Clear `running_at_ms` markers older than the stuck threshold. Returns how
/// many were cleared.
pub fn clear_stale_running(jobs: &mut [CronJob], now: i64) -> usize {
    let mut cleared = 0;
    for job in jobs.iter_mut() {
        if let Some(running_at) = job.state.running_at_ms {
            if now - running_at > STUCK_RUN_MS {
                warn!(job_id = %job.id, name = %job.name, "clearing stuck run marker");
                job.state.running_at_ms = None;
                cleared += 1;
            }
        }
    }
    cleared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        normalize_cron_job_create, CronJobCreate, CronPayload, CronSchedule,
    };

    fn sample_create() -> CronJobCreate {
        CronJobCreate {
            name: "sample".into(),
            description: None,
            agent_id: None,
            session_key: None,
            schedule: CronSchedule::Every {
                every_ms: 60_000,
                anchor_ms: None,
            },
            session_target: None,
            wake_mode: None,
            payload: CronPayload::SystemEvent { text: "tick".into() },
            delivery: None,
            enabled: None,
            delete_after_run: None,
        }
    }

    #[tokio::test]
    async fn store_round_trips_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron/jobs.json");

        let job = normalize_cron_job_create(sample_create()).unwrap();
        let id = job.id.clone();
        {
            let store = CronStore::open(&path).unwrap();
            store.with_jobs(|jobs| jobs.push(job)).await.unwrap();
        }

        let store = CronStore::open(&path).unwrap();
        let jobs = store.snapshot().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
    }

    #[tokio::test]
    async fn stale_running_markers_cleared_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let mut job = normalize_cron_job_create(sample_create()).unwrap();
        job.state.running_at_ms = Some(now_ms() - STUCK_RUN_MS - 60_000);
        {
            let store = CronStore::open(&path).unwrap();
            store.with_jobs(|jobs| jobs.push(job)).await.unwrap();
        }

        let store = CronStore::open(&path).unwrap();
        let jobs = store.snapshot().await;
        assert!(jobs[0].state.running_at_ms.is_none());
    }

    #[tokio::test]
    async fn fresh_running_markers_survive_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let mut job = normalize_cron_job_create(sample_create()).unwrap();
        job.state.running_at_ms = Some(now_ms() - 1_000);
        {
            let store = CronStore::open(&path).unwrap();
            store.with_jobs(|jobs| jobs.push(job)).await.unwrap();
        }

        let store = CronStore::open(&path).unwrap();
        assert!(store.snapshot().await[0].state.running_at_ms.is_some());
    }
}
