use std::sync::Mutex;

use switchboard_core::snippet::{normalize_snippet, outbound_snippet, MEDIA_SNIPPET};
use switchboard_core::types::{now_ms, ChatIds};

/// Entries older than this are pruned on every read and write.
const PENDING_TTL_MS: i64 = 2 * 60 * 1000;
/// Safety bound on the in-flight ledger.
const PENDING_MAX: usize = 512;

/// One in-flight outbound send, stashed so the provider's echo of our own
/// message can be recognised and suppressed.
#[derive(Debug, Clone)]
pub struct PendingOutboundMessageId {
    pub id: u64,
    pub account_id: String,
    pub session_key: Option<String>,
    pub outbound_target: String,
    pub chat: ChatIds,
    pub snippet_raw: String,
    pub snippet_norm: String,
    pub is_media_snippet: bool,
    pub created_at: i64,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<PendingOutboundMessageId>,
}

/// Process-memory ledger of sends currently in flight.
pub struct PendingOutboundTable {
    inner: Mutex<Inner>,
}

impl PendingOutboundTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Stash an outbound send before it reaches the provider. Returns the
    /// ledger id used by [`forget`] on send failure.
    pub fn remember(
        &self,
        account_id: &str,
        session_key: Option<&str>,
        outbound_target: &str,
        chat: &ChatIds,
        text: &str,
        has_media: bool,
    ) -> u64 {
        let (snippet_norm, is_media_snippet) = outbound_snippet(text, has_media);
        let mut inner = self.inner.lock().expect("pending table poisoned");
        prune(&mut inner);

        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push(PendingOutboundMessageId {
            id,
            account_id: account_id.to_string(),
            session_key: session_key.map(str::to_string),
            outbound_target: outbound_target.to_string(),
            chat: chat.clone(),
            snippet_raw: text.to_string(),
            snippet_norm,
            is_media_snippet,
            created_at: now_ms(),
        });

        if inner.entries.len() > PENDING_MAX {
            let excess = inner.entries.len() - PENDING_MAX;
            inner.entries.drain(..excess);
        }

        id
    }

    /// Match an inbound `fromMe` event against the ledger, removing the entry
    /// so the same send is recognised exactly once.
    pub fn consume(
        &self,
        account_id: &str,
        chat: &ChatIds,
        target: Option<&str>,
        text: &str,
        has_media: bool,
    ) -> Option<PendingOutboundMessageId> {
        let norm = normalize_snippet(text);
        let mut inner = self.inner.lock().expect("pending table poisoned");
        prune(&mut inner);

        let canonical = chat.canonical();
        let idx = inner.entries.iter().position(|e| {
            if e.account_id != account_id {
                return false;
            }
            // The stash may only know the outbound target token; the echo may
            // only carry chat ids. Any of the three spellings correlates.
            let place_matches = e.chat.overlaps(chat)
                || target
                    .map(|t| t.eq_ignore_ascii_case(&e.outbound_target))
                    .unwrap_or(false)
                || canonical
                    .as_deref()
                    .map(|c| c.eq_ignore_ascii_case(&e.outbound_target))
                    .unwrap_or(false);
            if !place_matches {
                return false;
            }
            if e.is_media_snippet {
                has_media || norm == MEDIA_SNIPPET
            } else {
                e.snippet_norm == norm
            }
        })?;

        Some(inner.entries.remove(idx))
    }

    /// Drop an entry after a failed send (the provider will never echo it).
    pub fn forget(&self, id: u64) {
        let mut inner = self.inner.lock().expect("pending table poisoned");
        prune(&mut inner);
        inner.entries.retain(|e| e.id != id);
    }

    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock().expect("pending table poisoned");
        prune(&mut inner);
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingOutboundTable {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(inner: &mut Inner) {
    let cutoff = now_ms() - PENDING_TTL_MS;
    inner.entries.retain(|e| e.created_at >= cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(guid: &str) -> ChatIds {
        ChatIds {
            chat_guid: Some(guid.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn echo_is_consumed_exactly_once() {
        let table = PendingOutboundTable::new();
        table.remember("acct", None, "+15550001111", &chat("c1"), "Hello there", false);

        let first = table.consume("acct", &chat("c1"), None, "Hello there", false);
        assert!(first.is_some());
        let second = table.consume("acct", &chat("c1"), None, "Hello there", false);
        assert!(second.is_none());
    }

    #[test]
    fn echo_matches_despite_markdown_rendering() {
        let table = PendingOutboundTable::new();
        table.remember("acct", None, "t", &chat("c1"), "**Bold** reply", false);
        assert!(table
            .consume("acct", &chat("c1"), None, "Bold reply", false)
            .is_some());
    }

    #[test]
    fn echo_chat_token_matches_stash_target() {
        // Outbound knew only the target token; the echo carries chat ids.
        let table = PendingOutboundTable::new();
        table.remember(
            "acct",
            None,
            "imessage;-;+15550001111",
            &ChatIds::default(),
            "On my way!",
            false,
        );
        assert!(table
            .consume("acct", &chat("iMessage;-;+15550001111"), None, "On my way!", false)
            .is_some());
    }

    #[test]
    fn target_match_works_without_chat_ids() {
        let table = PendingOutboundTable::new();
        table.remember("acct", None, "+15550001111", &ChatIds::default(), "hi", false);
        assert!(table
            .consume("acct", &ChatIds::default(), Some("+15550001111"), "hi", false)
            .is_some());
    }

    #[test]
    fn media_only_send_matches_media_echo() {
        let table = PendingOutboundTable::new();
        table.remember("acct", None, "t", &chat("c1"), "", true);
        assert!(table.consume("acct", &chat("c1"), None, "", true).is_some());
    }

    #[test]
    fn wrong_account_never_matches() {
        let table = PendingOutboundTable::new();
        table.remember("acct", None, "t", &chat("c1"), "hi", false);
        assert!(table.consume("other", &chat("c1"), None, "hi", false).is_none());
    }

    #[test]
    fn forget_removes_entry() {
        let table = PendingOutboundTable::new();
        let id = table.remember("acct", None, "t", &chat("c1"), "hi", false);
        table.forget(id);
        assert!(table.is_empty());
    }
}
