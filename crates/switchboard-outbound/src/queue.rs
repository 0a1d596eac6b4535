use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use switchboard_core::types::{now_ms, MessagePayload};

use crate::error::{OutboundError, Result};

/// Attempt budget before an entry is abandoned to `failed/`.
pub const MAX_RETRIES: u32 = 5;

/// Backoff (ms) applied per retry count: 5s → 25s → 2m → 10m → 10m (capped).
pub const ERROR_BACKOFF_SCHEDULE: [u64; 5] = [5_000, 25_000, 120_000, 600_000, 600_000];

/// Error substrings that mark a delivery as unretryable. Matched verbatim
/// against the provider error message.
const PERMANENT_ERROR_MARKERS: [&str; 7] = [
    "No conversation reference found",
    "chat not found",
    "user not found",
    "Bot was blocked",
    "bot was kicked",
    "chat_id is empty",
    "Outbound not configured for channel:",
];

/// True when retrying `message` can never succeed.
pub fn is_permanent_error(message: &str) -> bool {
    PERMANENT_ERROR_MARKERS.iter().any(|m| message.contains(m))
}

/// Transcript-mirror target carried alongside a queue entry so crash recovery
/// can still mirror a late delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSpec {
    pub session_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// One durable outbound attempt, serialized as
/// `<stateDir>/delivery-queue/{uuid}.json`. Permanent failures move to
/// `delivery-queue/failed/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryQueueEntry {
    pub id: Uuid,
    pub channel: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub payloads: Vec<MessagePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub best_effort: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub gif_playback: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub silent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<MirrorSpec>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: i64,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl DeliveryQueueEntry {
    pub fn new(channel: &str, to: &str, payloads: Vec<MessagePayload>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            to: to.to_string(),
            account_id: None,
            payloads,
            thread_id: None,
            reply_to_id: None,
            best_effort: false,
            gif_playback: false,
            silent: false,
            mirror: None,
            retry_count: 0,
            last_error: None,
            created_at: now_ms(),
        }
    }
}

/// What [`DeliveryQueue::fail`] decided about an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Moved to `failed/` — a permanent error or exhausted retries.
    Abandoned,
    /// Retry count incremented; the entry waits for the next recovery pass.
    WillRetry(u32),
}

/// Write-ahead journal of outbound deliveries. The filesystem is the source
/// of truth: an entry file exists iff the delivery is still owed, and each
/// entry is owned by at most one in-flight attempt.
pub struct DeliveryQueue {
    dir: PathBuf,
}

impl DeliveryQueue {
    /// Open (and create) the queue directories under `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("delivery-queue");
        std::fs::create_dir_all(dir.join("failed")).map_err(|e| OutboundError::QueueIo {
            path: dir.display().to_string(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist an entry before the first send attempt.
    pub fn enqueue(&self, entry: &DeliveryQueueEntry) -> Result<()> {
        let path = self.entry_path(&entry.id);
        write_atomic(&path, entry)
    }

    /// Delivery completed (or was abort-acknowledged): drop the journal entry.
    pub fn ack(&self, id: &Uuid) {
        let path = self.entry_path(id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "delivery queue ack failed");
            }
        }
    }

    /// Record a failed attempt. Permanent errors (and exhausted budgets) move
    /// the entry to `failed/`; anything else increments the retry count in
    /// place.
    pub fn fail(&self, id: &Uuid, error_message: &str) -> Result<FailOutcome> {
        let Some(mut entry) = self.read_entry(&self.entry_path(id))? else {
            // Someone acked concurrently; nothing to record.
            return Ok(FailOutcome::Abandoned);
        };

        entry.last_error = Some(error_message.to_string());

        if is_permanent_error(error_message) {
            info!(id = %id, error = %error_message, "delivery failed permanently");
            self.move_to_failed(&entry)?;
            return Ok(FailOutcome::Abandoned);
        }

        entry.retry_count += 1;
        if entry.retry_count >= MAX_RETRIES {
            info!(id = %id, retries = entry.retry_count, "delivery retry budget exhausted");
            self.move_to_failed(&entry)?;
            return Ok(FailOutcome::Abandoned);
        }

        write_atomic(&self.entry_path(id), &entry)?;
        Ok(FailOutcome::WillRetry(entry.retry_count))
    }

    /// All pending entries, oldest first.
    pub fn pending(&self) -> Result<Vec<DeliveryQueueEntry>> {
        let mut entries = Vec::new();
        let read_dir = std::fs::read_dir(&self.dir).map_err(|e| OutboundError::QueueIo {
            path: self.dir.display().to_string(),
            source: e,
        })?;
        for item in read_dir.flatten() {
            let path = item.path();
            if path.extension().map(|e| e == "json") != Some(true) {
                continue;
            }
            match self.read_entry(&path)? {
                Some(entry) => entries.push(entry),
                None => continue,
            }
        }
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    /// Move an entry to `failed/` regardless of its retry budget.
    pub fn move_to_failed(&self, entry: &DeliveryQueueEntry) -> Result<()> {
        let failed = self.dir.join("failed").join(format!("{}.json", entry.id));
        write_atomic(&failed, entry)?;
        self.ack(&entry.id);
        Ok(())
    }

    fn entry_path(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read_entry(&self, path: &Path) -> Result<Option<DeliveryQueueEntry>> {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt delivery queue entry skipped");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OutboundError::QueueIo {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }
}

fn write_atomic(path: &Path, entry: &DeliveryQueueEntry) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(entry)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &bytes).map_err(|e| OutboundError::QueueIo {
        path: tmp.display().to_string(),
        source: e,
    })?;
    std::fs::rename(&tmp, path).map_err(|e| OutboundError::QueueIo {
        path: path.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_markers_classify() {
        assert!(is_permanent_error("telegram: Bot was blocked by the user"));
        assert!(is_permanent_error("Outbound not configured for channel: matrix"));
        assert!(!is_permanent_error("connection reset by peer"));
    }

    #[test]
    fn enqueue_ack_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DeliveryQueue::open(dir.path()).unwrap();
        let entry = DeliveryQueueEntry::new("telegram", "123", vec![MessagePayload::text("hi")]);
        queue.enqueue(&entry).unwrap();
        assert_eq!(queue.pending().unwrap().len(), 1);
        queue.ack(&entry.id);
        assert!(queue.pending().unwrap().is_empty());
    }

    #[test]
    fn transient_failure_increments_then_abandons() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DeliveryQueue::open(dir.path()).unwrap();
        let entry = DeliveryQueueEntry::new("telegram", "123", vec![MessagePayload::text("hi")]);
        queue.enqueue(&entry).unwrap();

        for attempt in 1..MAX_RETRIES {
            let outcome = queue.fail(&entry.id, "timeout").unwrap();
            assert_eq!(outcome, FailOutcome::WillRetry(attempt));
        }
        let outcome = queue.fail(&entry.id, "timeout").unwrap();
        assert_eq!(outcome, FailOutcome::Abandoned);
        assert!(queue.pending().unwrap().is_empty());
        assert!(dir
            .path()
            .join("delivery-queue/failed")
            .join(format!("{}.json", entry.id))
            .exists());
    }

    #[test]
    fn permanent_failure_moves_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DeliveryQueue::open(dir.path()).unwrap();
        let entry = DeliveryQueueEntry::new("telegram", "123", vec![MessagePayload::text("hi")]);
        queue.enqueue(&entry).unwrap();

        let outcome = queue.fail(&entry.id, "chat not found").unwrap();
        assert_eq!(outcome, FailOutcome::Abandoned);
        assert!(queue.pending().unwrap().is_empty());
    }

    #[test]
    fn entry_json_uses_camel_case() {
        let entry = DeliveryQueueEntry::new("slack", "C1", vec![MessagePayload::text("x")]);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"retryCount\""));
        assert!(json.contains("\"createdAt\""));
        assert!(!json.contains("\"retry_count\""));
    }
}
