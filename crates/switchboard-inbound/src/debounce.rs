//! Per-target webhook coalescing.
//!
//! Providers split one logical message across several webhook events (text,
//! then a URL-preview balloon 200 ms later). Events sharing a stable key that
//! arrive within the window are merged into one message before processing.
//! `fromMe` traffic and control commands bypass the window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use switchboard_core::types::Message;

use crate::commands::contains_control_command;

/// Default coalescing window.
pub const DEBOUNCE_WINDOW_MS: u64 = 500;

/// A normalized message still carrying its ingress coordinates.
#[derive(Debug, Clone)]
pub struct ScopedMessage {
    pub channel: String,
    pub account_id: String,
    pub message: Message,
}

/// Coalesces webhook events under a stable per-target key.
///
/// Flushed (merged) messages come out of the `mpsc` receiver handed to
/// [`DebounceQueue::new`]; the caller drives processing from there.
pub struct DebounceQueue {
    window: Duration,
    buffers: Arc<Mutex<HashMap<String, Vec<ScopedMessage>>>>,
    flush_tx: mpsc::UnboundedSender<ScopedMessage>,
    shutdown: CancellationToken,
}

impl DebounceQueue {
    pub fn new(window: Duration, flush_tx: mpsc::UnboundedSender<ScopedMessage>) -> Self {
        Self {
            window,
            buffers: Arc::new(Mutex::new(HashMap::new())),
            flush_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stable coalescing key: balloon identity when present, else the message
    /// id, else `(chatKey, senderId)` — always scoped to the account.
    pub fn key_of(scoped: &ScopedMessage) -> String {
        let msg = &scoped.message;
        let tail = if let (Some(balloon), Some(assoc)) =
            (&msg.balloon_bundle_id, &msg.associated_message_guid)
        {
            format!("balloon:{balloon}:{assoc}")
        } else if !msg.message_id.trim().is_empty() {
            format!("msg:{}", msg.message_id)
        } else {
            format!(
                "chat:{}:{}",
                msg.chat.canonical().unwrap_or_default(),
                msg.sender_id
            )
        };
        format!("{}:{}:{tail}", scoped.channel, scoped.account_id)
    }

    /// Offer a message to the coalescer.
    ///
    /// Returns `Some` when the message bypasses debouncing entirely
    /// (`fromMe` and control commands are time-critical); `None` when it was
    /// buffered and will surface on the flush channel.
    pub fn offer(&self, scoped: ScopedMessage) -> Option<ScopedMessage> {
        if scoped.message.from_me || contains_control_command(&scoped.message.text) {
            return Some(scoped);
        }

        let key = Self::key_of(&scoped);
        let is_first = {
            let mut buffers = self.buffers.lock().expect("debounce buffers poisoned");
            let bucket = buffers.entry(key.clone()).or_default();
            bucket.push(scoped);
            bucket.len() == 1
        };

        if is_first {
            let buffers = Arc::clone(&self.buffers);
            let flush_tx = self.flush_tx.clone();
            let shutdown = self.shutdown.clone();
            let window = self.window;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(window) => {}
                    _ = shutdown.cancelled() => {}
                }
                let entries = buffers
                    .lock()
                    .expect("debounce buffers poisoned")
                    .remove(&key)
                    .unwrap_or_default();
                if let Some(merged) = merge_entries(entries) {
                    debug!(key = %key, "debounce flush");
                    let _ = flush_tx.send(merged);
                }
            });
        }

        None
    }

    /// Flush everything immediately (graceful shutdown).
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// Combine coalesced entries into one message.
///
/// Non-duplicate texts concatenate in arrival order; attachments are
/// unioned; the latest timestamp wins; reply context is preserved from
/// whichever entry carries it; the balloon bundle id is cleared once entries
/// have been combined.
fn merge_entries(mut entries: Vec<ScopedMessage>) -> Option<ScopedMessage> {
    if entries.is_empty() {
        return None;
    }
    let merged_count = entries.len();
    let mut scoped = entries.remove(0);
    let base = &mut scoped.message;

    for entry in entries {
        let entry = entry.message;
        if !entry.text.is_empty() && !base.text.contains(&entry.text) {
            if !base.text.is_empty() {
                base.text.push('\n');
            }
            base.text.push_str(&entry.text);
        }

        for attachment in entry.attachments {
            let duplicate = base.attachments.iter().any(|a| {
                (a.id.is_some() && a.id == attachment.id)
                    || (a.url.is_some() && a.url == attachment.url)
            });
            if !duplicate {
                base.attachments.push(attachment);
            }
        }

        base.timestamp = base.timestamp.max(entry.timestamp);

        if base.reply_to_id.is_none() {
            base.reply_to_id = entry.reply_to_id;
            base.reply_to_body = entry.reply_to_body;
            base.reply_to_sender = entry.reply_to_sender;
        }
    }

    if merged_count > 1 {
        base.balloon_bundle_id = None;
    }
    Some(scoped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::types::Attachment;

    fn scoped(id: &str, text: &str) -> ScopedMessage {
        ScopedMessage {
            channel: "bluebubbles".into(),
            account_id: "primary".into(),
            message: Message {
                message_id: id.into(),
                sender_id: "alice".into(),
                text: text.into(),
                timestamp: 1,
                ..Default::default()
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn url_preview_events_coalesce_into_one() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = DebounceQueue::new(Duration::from_millis(DEBOUNCE_WINDOW_MS), tx);

        let mut first = scoped("m1", "https://x.test");
        first.message.balloon_bundle_id = Some("com.apple.messages.URLBalloonProvider".into());
        first.message.associated_message_guid = Some("g1".into());

        let mut second = scoped("m1", "https://x.test");
        second.message.balloon_bundle_id = Some("com.apple.messages.URLBalloonProvider".into());
        second.message.associated_message_guid = Some("g1".into());
        second.message.timestamp = 5;
        second.message.attachments.push(Attachment {
            id: Some("a1".into()),
            ..Default::default()
        });

        assert!(queue.offer(first).is_none());
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(queue.offer(second).is_none());

        tokio::time::advance(Duration::from_millis(400)).await;
        let merged = rx.recv().await.unwrap().message;
        assert_eq!(merged.text, "https://x.test");
        assert_eq!(merged.attachments.len(), 1);
        assert_eq!(merged.timestamp, 5);
        assert!(merged.balloon_bundle_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_texts_concatenate_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = DebounceQueue::new(Duration::from_millis(500), tx);

        assert!(queue.offer(scoped("m2", "part one")).is_none());
        let mut second = scoped("m2", "part two");
        second.message.timestamp = 9;
        assert!(queue.offer(second).is_none());

        tokio::time::advance(Duration::from_millis(600)).await;
        let merged = rx.recv().await.unwrap().message;
        assert_eq!(merged.text, "part one\npart two");
        assert_eq!(merged.timestamp, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn accounts_do_not_share_buffers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = DebounceQueue::new(Duration::from_millis(500), tx);

        let mut other = scoped("m1", "same id, other account");
        other.account_id = "secondary".into();
        assert!(queue.offer(scoped("m1", "first")).is_none());
        assert!(queue.offer(other).is_none());

        tokio::time::advance(Duration::from_millis(600)).await;
        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_ne!(a.account_id, b.account_id);
    }

    #[tokio::test(start_paused = true)]
    async fn from_me_bypasses_window() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let queue = DebounceQueue::new(Duration::from_millis(500), tx);
        let mut echo = scoped("m3", "our own echo");
        echo.message.from_me = true;
        assert!(queue.offer(echo).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn control_command_bypasses_window() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let queue = DebounceQueue::new(Duration::from_millis(500), tx);
        assert!(queue.offer(scoped("m4", "/status")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = DebounceQueue::new(Duration::from_secs(3600), tx);
        assert!(queue.offer(scoped("m5", "pending")).is_none());
        queue.stop();
        // No time advance needed: shutdown short-circuits the window.
        let merged = rx.recv().await.unwrap().message;
        assert_eq!(merged.text, "pending");
    }
}
