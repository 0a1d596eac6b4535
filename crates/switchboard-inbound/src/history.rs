//! Inbound history: the local observation log, the opportunistic backfill
//! state machine, and the budgeted snapshot surfaced to the agent.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use switchboard_core::types::{now_ms, HistoryEntry};

/// Per-entry storage bound (chars).
pub const HISTORY_ENTRY_STORE_MAX: usize = 2_000;
/// Per-entry bound when surfaced to the agent (chars).
pub const HISTORY_ENTRY_SURFACE_MAX: usize = 1_200;
/// Total snapshot bound (chars).
pub const HISTORY_SURFACE_TOTAL_MAX: usize = 12_000;

/// Backfill attempt schedule: 5 s base, doubling to a 2 min cap.
const BACKFILL_BASE_DELAY_MS: i64 = 5_000;
const BACKFILL_MAX_DELAY_MS: i64 = 120_000;
const BACKFILL_MAX_ATTEMPTS: u32 = 6;
/// Give up entirely half an hour after the first attempt.
const BACKFILL_CUTOFF_MS: i64 = 30 * 60 * 1000;

/// Provider history API, injected so tests run without a network.
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch(
        &self,
        account_id: &str,
        history_identifier: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, String>;
}

#[derive(Debug, Clone)]
enum BackfillState {
    InProgress {
        attempts: u32,
        first_attempt_at: i64,
        next_attempt_at: i64,
    },
    Resolved,
}

/// History bookkeeping per `(accountId, historyIdentifier)`.
///
/// Locally observed entries accumulate in a bounded ring; backfill merges the
/// provider's view in opportunistically, driven by pipeline ticks rather than
/// its own timer.
pub struct HistoryLog {
    entries: Mutex<HashMap<String, VecDeque<HistoryEntry>>>,
    backfill: Mutex<HashMap<String, BackfillState>>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            backfill: Mutex::new(HashMap::new()),
        }
    }

    /// Record a locally observed message.
    pub fn observe(
        &self,
        account_id: &str,
        history_identifier: &str,
        mut entry: HistoryEntry,
        limit: usize,
    ) {
        entry.body = truncate_chars(&entry.body, HISTORY_ENTRY_STORE_MAX);
        let key = log_key(account_id, history_identifier);
        let mut entries = self.entries.lock().expect("history log poisoned");
        let bucket = entries.entry(key).or_default();
        bucket.push_back(entry);
        while bucket.len() > limit.max(1) {
            bucket.pop_front();
        }
    }

    /// Opportunistic backfill tick for a chat the pipeline just touched.
    ///
    /// Drives the per-chat state machine: schedules attempts with exponential
    /// backoff, merges a successful fetch with local observations (dedup by
    /// `messageId` falling back to `(sender, body, timestamp)`), truncates to
    /// the `limit` most recent, and resolves. Returns `true` when this tick
    /// performed a fetch.
    pub async fn backfill_tick(
        &self,
        fetcher: &dyn HistoryFetcher,
        account_id: &str,
        history_identifier: &str,
        limit: usize,
    ) -> bool {
        let key = log_key(account_id, history_identifier);
        let now = now_ms();

        // Decide under the lock whether this tick attempts a fetch.
        let attempt = {
            let mut backfill = self.backfill.lock().expect("backfill state poisoned");
            match backfill.get(&key).cloned() {
                Some(BackfillState::Resolved) => None,
                Some(BackfillState::InProgress {
                    attempts,
                    first_attempt_at,
                    next_attempt_at,
                }) => {
                    if attempts >= BACKFILL_MAX_ATTEMPTS
                        || now - first_attempt_at > BACKFILL_CUTOFF_MS
                    {
                        backfill.insert(key.clone(), BackfillState::Resolved);
                        None
                    } else if now < next_attempt_at {
                        None
                    } else {
                        let delay = backoff_delay(attempts + 1);
                        backfill.insert(
                            key.clone(),
                            BackfillState::InProgress {
                                attempts: attempts + 1,
                                first_attempt_at,
                                next_attempt_at: now + delay,
                            },
                        );
                        Some(attempts + 1)
                    }
                }
                None => {
                    backfill.insert(
                        key.clone(),
                        BackfillState::InProgress {
                            attempts: 1,
                            first_attempt_at: now,
                            next_attempt_at: now + backoff_delay(1),
                        },
                    );
                    Some(1)
                }
            }
        };

        let Some(attempt) = attempt else {
            return false;
        };

        match fetcher.fetch(account_id, history_identifier, limit).await {
            Ok(remote) => {
                let mut entries = self.entries.lock().expect("history log poisoned");
                let bucket = entries.entry(key.clone()).or_default();
                let merged = merge_history(bucket.iter().cloned().collect(), remote, limit);
                *bucket = merged.into();
                self.backfill
                    .lock()
                    .expect("backfill state poisoned")
                    .insert(key, BackfillState::Resolved);
                debug!(account = account_id, chat = history_identifier, "history backfill resolved");
                true
            }
            Err(e) => {
                warn!(
                    account = account_id,
                    chat = history_identifier,
                    attempt,
                    error = %e,
                    "history backfill attempt failed"
                );
                true
            }
        }
    }

    /// Budgeted snapshot for the agent prompt: newest entries scanned first
    /// until the total budget fills, then emitted oldest-to-newest.
    pub fn snapshot(&self, account_id: &str, history_identifier: &str) -> String {
        let entries = self.entries.lock().expect("history log poisoned");
        let Some(bucket) = entries.get(&log_key(account_id, history_identifier)) else {
            return String::new();
        };

        let mut lines: Vec<String> = Vec::new();
        let mut total = 0usize;
        for entry in bucket.iter().rev() {
            let body = truncate_chars(&entry.body, HISTORY_ENTRY_SURFACE_MAX);
            let line = format!("{}: {}", entry.sender, body);
            let cost = line.chars().count() + 1;
            if total + cost > HISTORY_SURFACE_TOTAL_MAX {
                break;
            }
            total += cost;
            lines.push(line);
        }
        lines.reverse();
        lines.join("\n")
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new()
    }
}

fn log_key(account_id: &str, history_identifier: &str) -> String {
    format!("{account_id}:{history_identifier}")
}

fn backoff_delay(attempt: u32) -> i64 {
    let factor = 1i64 << (attempt.saturating_sub(1)).min(16);
    (BACKFILL_BASE_DELAY_MS * factor).min(BACKFILL_MAX_DELAY_MS)
}

fn dedup_key(entry: &HistoryEntry) -> String {
    match &entry.message_id {
        Some(id) if !id.is_empty() => format!("id:{id}"),
        _ => format!(
            "tuple:{}:{}:{}",
            entry.sender,
            entry.body,
            entry.timestamp.unwrap_or_default()
        ),
    }
}

/// Merge provider history with local observations, newest `limit` kept.
fn merge_history(
    local: Vec<HistoryEntry>,
    remote: Vec<HistoryEntry>,
    limit: usize,
) -> Vec<HistoryEntry> {
    let mut seen = std::collections::HashSet::new();
    let mut merged: Vec<HistoryEntry> = Vec::new();

    for entry in remote.into_iter().chain(local) {
        if seen.insert(dedup_key(&entry)) {
            merged.push(entry);
        }
    }

    merged.sort_by_key(|e| e.timestamp.unwrap_or_default());
    if merged.len() > limit {
        let cut = merged.len() - limit;
        merged.drain(..cut);
    }
    merged
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}
