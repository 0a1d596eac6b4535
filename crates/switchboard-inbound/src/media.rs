//! Attachment download with per-attachment byte caps.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::{InboundError, Result};

/// Downloads inbound attachments into the media store.
pub struct AttachmentDownloader {
    client: reqwest::Client,
    media_dir: PathBuf,
}

impl AttachmentDownloader {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            client: reqwest::Client::new(),
            media_dir: state_dir.join("media"),
        }
    }

    /// Fetch `url` into the media store, enforcing `max_bytes`.
    ///
    /// The cap is checked against Content-Length up front and again while
    /// streaming, so a lying server still cannot blow the budget.
    pub async fn download(&self, url: &str, max_bytes: u64) -> Result<PathBuf> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| InboundError::AttachmentFetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| InboundError::AttachmentFetch(e.to_string()))?;

        if let Some(len) = response.content_length() {
            if len > max_bytes {
                return Err(InboundError::AttachmentTooLarge {
                    size: len,
                    cap: max_bytes,
                });
            }
        }

        tokio::fs::create_dir_all(&self.media_dir).await?;
        let path = self.media_dir.join(file_name_for(url));
        let mut file = tokio::fs::File::create(&path).await?;

        let mut written: u64 = 0;
        let mut response = response;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| InboundError::AttachmentFetch(e.to_string()))?
        {
            written += chunk.len() as u64;
            if written > max_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(InboundError::AttachmentTooLarge {
                    size: written,
                    cap: max_bytes,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!(url, bytes = written, path = %path.display(), "attachment saved");
        Ok(path)
    }
}

fn file_name_for(url: &str) -> String {
    let ext = url
        .rsplit('/')
        .next()
        .and_then(|seg| seg.split('?').next())
        .and_then(|seg| seg.rsplit_once('.').map(|(_, e)| e.to_string()))
        .filter(|e| e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()));

    match ext {
        Some(ext) => format!("{}.{ext}", Uuid::new_v4()),
        None => Uuid::new_v4().to_string(),
    }
}
