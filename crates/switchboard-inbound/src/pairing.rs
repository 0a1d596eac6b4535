//! Pairing handshake for unknown DM senders.
//!
//! Under `dm_policy=pairing`, an unknown sender's first message creates a
//! pairing request with a short one-time code. The pairing reply is sent
//! exactly once, on the creation event; repeat messages from the same sender
//! while the request is open are dropped silently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use switchboard_core::types::now_ms;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub channel: String,
    pub sender_id: String,
    pub code: String,
    pub created_at: i64,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PairingFile {
    requests: HashMap<String, PairingRequest>,
}

/// Whether an upsert created a new request (reply now, once) or found an
/// existing one (stay silent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingUpsert {
    Created { code: String },
    Existing,
}

/// JSON-file-backed store of open pairing requests, keyed `channel:sender`.
pub struct PairingStore {
    path: PathBuf,
    state: Mutex<PairingFile>,
}

impl PairingStore {
    /// Load (or lazily create) the store at `<state_dir>/pairing.json`.
    pub fn open(state_dir: &std::path::Path) -> Result<Self> {
        let path = state_dir.join("pairing.json");
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "pairing store corrupt, starting empty");
                PairingFile::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PairingFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Upsert a pairing request for `(channel, sender)`.
    ///
    /// Creation generates the one-time code and persists; an existing open
    /// request is left untouched so no second reply goes out.
    pub fn upsert(
        &self,
        channel: &str,
        sender_id: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<PairingUpsert> {
        let key = format!("{channel}:{sender_id}");
        let mut state = self.state.lock().expect("pairing store poisoned");

        if state.requests.contains_key(&key) {
            return Ok(PairingUpsert::Existing);
        }

        let code = short_code();
        state.requests.insert(
            key,
            PairingRequest {
                channel: channel.to_string(),
                sender_id: sender_id.to_string(),
                code: code.clone(),
                created_at: now_ms(),
                meta,
            },
        );
        self.persist(&state)?;
        info!(channel, sender = sender_id, "pairing request created");
        Ok(PairingUpsert::Created { code })
    }

    /// Approve and remove an open request by code, returning the sender it
    /// belonged to.
    pub fn approve(&self, code: &str) -> Result<Option<PairingRequest>> {
        let mut state = self.state.lock().expect("pairing store poisoned");
        let key = state
            .requests
            .iter()
            .find(|(_, r)| r.code.eq_ignore_ascii_case(code))
            .map(|(k, _)| k.clone());
        let Some(key) = key else {
            return Ok(None);
        };
        let removed = state.requests.remove(&key);
        self.persist(&state)?;
        Ok(removed)
    }

    pub fn open_requests(&self) -> Vec<PairingRequest> {
        let state = self.state.lock().expect("pairing store poisoned");
        state.requests.values().cloned().collect()
    }

    fn persist(&self, state: &PairingFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// One-time pairing reply, containing the sender id and the short code.
pub fn pairing_reply_text(sender_id: &str, code: &str) -> String {
    format!(
        "Hi! This assistant only talks to approved contacts. \
         Share this code with the operator to get access: {code} (your id: {sender_id})"
    )
}

fn short_code() -> String {
    // First 8 hex chars of a UUID: short enough to read aloud, unique enough
    // for the open-request window.
    Uuid::new_v4().simple().to_string()[..8].to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_sent_only_on_creation() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::open(dir.path()).unwrap();

        let first = store.upsert("bluebubbles", "+15550001111", None).unwrap();
        assert!(matches!(first, PairingUpsert::Created { .. }));

        // Same sender again within the window: no second reply.
        let second = store.upsert("bluebubbles", "+15550001111", None).unwrap();
        assert_eq!(second, PairingUpsert::Existing);
    }

    #[test]
    fn requests_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PairingStore::open(dir.path()).unwrap();
            store.upsert("telegram", "42", None).unwrap();
        }
        let store = PairingStore::open(dir.path()).unwrap();
        assert_eq!(store.open_requests().len(), 1);
        // Restart must not re-send the pairing reply.
        assert_eq!(store.upsert("telegram", "42", None).unwrap(), PairingUpsert::Existing);
    }

    #[test]
    fn approve_removes_by_code() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::open(dir.path()).unwrap();
        let PairingUpsert::Created { code } = store.upsert("telegram", "42", None).unwrap() else {
            panic!("expected creation");
        };
        let approved = store.approve(&code).unwrap().unwrap();
        assert_eq!(approved.sender_id, "42");
        assert!(store.open_requests().is_empty());
    }
}
