//! Append-only transcript mirror.
//!
//! Each session entry may own a transcript file (JSON lines, one record per
//! delivered reply). Appends are strictly ordered per session key and
//! best-effort: a failed append is logged and never blocks delivery.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use switchboard_core::types::now_ms;

use crate::store::SessionStore;

#[derive(Debug, Serialize)]
struct TranscriptRecord<'a> {
    role: &'static str,
    text: &'a str,
    timestamp: i64,
}

impl SessionStore {
    /// Append an assistant record to the session's transcript.
    ///
    /// Resolves (and persists) the entry's `session_file` on first use, then
    /// appends under the store lock so records stay ordered per key. Errors
    /// are swallowed after a warn log.
    pub async fn append_transcript(&self, store_path: &Path, session_key: &str, text: &str) {
        let entry = self
            .upsert(store_path, session_key, |e| {
                if e.session_file.is_none() {
                    e.session_file = Some(
                        default_transcript_path(store_path, session_key)
                            .to_string_lossy()
                            .to_string(),
                    );
                }
            })
            .await;

        let file = match entry {
            Ok(e) => match e.session_file {
                Some(f) => PathBuf::from(f),
                None => return,
            },
            Err(e) => {
                warn!(session = %session_key, error = %e, "transcript: entry resolve failed");
                return;
            }
        };

        let record = TranscriptRecord {
            role: "assistant",
            text,
            timestamp: now_ms(),
        };
        let mut line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                warn!(session = %session_key, error = %e, "transcript: encode failed");
                return;
            }
        };
        line.push('\n');

        // Ordering guarantee: appends share the store-path lock.
        let _guard = self.lock_for(store_path).lock_owned().await;
        if let Err(e) = append_line(&file, line.as_bytes()).await {
            warn!(file = %file.display(), error = %e, "transcript: append failed");
        }
    }
}

async fn append_line(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}

fn default_transcript_path(store_path: &Path, session_key: &str) -> PathBuf {
    let dir = store_path.parent().unwrap_or_else(|| Path::new("."));
    let safe: String = session_key
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    dir.join("transcripts").join(format!("{safe}.jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_creates_file_and_orders_records() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("sessions.json");
        let store = SessionStore::new();

        store.append_transcript(&store_path, "agent:main:main", "one").await;
        store.append_transcript(&store_path, "agent:main:main", "two").await;

        let entry = store
            .get(&store_path, "agent:main:main")
            .await
            .unwrap()
            .unwrap();
        let file = entry.session_file.unwrap();
        let contents = std::fs::read_to_string(&file).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"one\""));
        assert!(lines[1].contains("\"two\""));
    }
}
