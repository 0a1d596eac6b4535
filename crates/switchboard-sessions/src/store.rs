use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use switchboard_core::types::now_ms;

use crate::error::{Result, SessionError};

/// Per-(agent, session-key) persistent record.
///
/// `updated_at` is monotonically non-decreasing; `session_file`, when set,
/// names the append-only transcript owned by this entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_sent_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_context: Option<serde_json::Value>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            session_file: None,
            updated_at: now_ms(),
            last_channel: None,
            last_account_id: None,
            last_to: None,
            last_provider: None,
            last_heartbeat_text: None,
            last_heartbeat_sent_at: None,
            delivery_context: None,
        }
    }
}

/// On-disk map `sessionKey → SessionEntry`, one JSON file per resolved store
/// path. All read-modify-write cycles are serialized through an in-process
/// mutex keyed by that path; writes are atomic (temp file + rename).
pub struct SessionStore {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Substitute `{agentId}` into a store path template.
    pub fn resolve_store_path(template: &str, agent_id: &str) -> PathBuf {
        PathBuf::from(template.replace("{agentId}", agent_id))
    }

    /// Read a single entry without taking the write path.
    pub async fn get(&self, store_path: &Path, key: &str) -> Result<Option<SessionEntry>> {
        let _guard = self.lock_for(store_path).lock_owned().await;
        let map = load_map(store_path).await?;
        Ok(map.get(key).cloned())
    }

    /// `updatedAt` of an entry, if present. Cheaper companion to [`get`] for
    /// freshness checks.
    pub async fn read_updated_at(&self, store_path: &Path, key: &str) -> Result<Option<i64>> {
        Ok(self.get(store_path, key).await?.map(|e| e.updated_at))
    }

    /// Create-or-mutate an entry under the store lock.
    ///
    /// The mutator sees the current entry (or a fresh one); afterwards
    /// `updated_at` is clamped so it never moves backwards.
    pub async fn upsert<F>(&self, store_path: &Path, key: &str, mutate: F) -> Result<SessionEntry>
    where
        F: FnOnce(&mut SessionEntry),
    {
        let _guard = self.lock_for(store_path).lock_owned().await;
        let mut map = load_map(store_path).await?;
        let mut entry = map.get(key).cloned().unwrap_or_else(SessionEntry::new);
        let previous_updated = entry.updated_at;

        mutate(&mut entry);
        entry.updated_at = entry.updated_at.max(previous_updated).max(now_ms());

        map.insert(key.to_string(), entry.clone());
        persist_map(store_path, &map).await?;
        Ok(entry)
    }

    /// List every key in the store, for maintenance sweeps.
    pub async fn keys(&self, store_path: &Path) -> Result<Vec<String>> {
        let _guard = self.lock_for(store_path).lock_owned().await;
        let map = load_map(store_path).await?;
        Ok(map.keys().cloned().collect())
    }

    pub(crate) fn lock_for(&self, store_path: &Path) -> Arc<Mutex<()>> {
        let key = store_path.to_string_lossy().to_string();
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn load_map(path: &Path) -> Result<BTreeMap<String, SessionEntry>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| SessionError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(SessionError::Io {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

async fn persist_map(path: &Path, map: &BTreeMap<String, SessionEntry>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %parent.display(), error = %e, "session store dir create failed");
        }
    }
    let bytes = serde_json::to_vec_pretty(map)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| SessionError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| SessionError::Io {
            path: path.display().to_string(),
            source: e,
        })
}
