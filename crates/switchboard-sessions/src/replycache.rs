use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use switchboard_core::types::ChatIds;

/// Upper bound on live cache entries across all accounts; oldest evicted first.
const REPLY_CACHE_MAX: usize = 4000;
/// Short-id wrap-around bound. Ids restart at 1 after this; by then the old
/// holder has long been evicted.
const SHORT_ID_MAX: u32 = 999_999;

/// One remembered provider message.
#[derive(Debug, Clone)]
struct CacheEntry {
    short_id: u32,
    account_id: String,
    uuid: String,
    chat: ChatIds,
    sender_label: String,
    body: String,
    timestamp: i64,
}

/// Reply context handed back to the inbound pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    pub short_id: u32,
    pub body: Option<String>,
    pub sender_label: Option<String>,
}

#[derive(Default)]
struct Inner {
    /// LRU order, oldest at the front. Keys are `(account, uuid)`.
    order: VecDeque<(String, String)>,
    entries: HashMap<(String, String), CacheEntry>,
    /// uuid → (account, shortId); O(1) cross-account lookup.
    by_uuid: HashMap<String, (String, u32)>,
    /// (account, shortId) → uuid.
    by_short: HashMap<(String, u32), String>,
    next_id: HashMap<String, u32>,
}

/// Short-id ↔ provider-UUID bijection with per-chat reply-context lookup.
///
/// Short ids are compact positive integers allocated per account so agent
/// prompts and reply tags don't carry full provider UUIDs.
pub struct ReplyCache {
    inner: Mutex<Inner>,
}

impl ReplyCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Remember a message. Idempotent by `(account_id, uuid)`: re-remembering
    /// refreshes recency and returns the original short id.
    pub fn remember(
        &self,
        account_id: &str,
        uuid: &str,
        chat: &ChatIds,
        sender_label: &str,
        body: &str,
        timestamp: i64,
    ) -> u32 {
        let mut inner = self.inner.lock().expect("reply cache poisoned");
        let key = (account_id.to_string(), uuid.to_string());

        if let Some(existing) = inner.entries.get_mut(&key) {
            existing.body = body.to_string();
            existing.sender_label = sender_label.to_string();
            existing.timestamp = timestamp;
            let short = existing.short_id;
            // Refresh LRU position.
            inner.order.retain(|k| k != &key);
            inner.order.push_back(key);
            return short;
        }

        let counter = inner.next_id.entry(account_id.to_string()).or_insert(0);
        *counter = if *counter >= SHORT_ID_MAX { 1 } else { *counter + 1 };
        let short_id = *counter;

        let entry = CacheEntry {
            short_id,
            account_id: account_id.to_string(),
            uuid: uuid.to_string(),
            chat: chat.clone(),
            sender_label: sender_label.to_string(),
            body: body.to_string(),
            timestamp,
        };

        inner.by_uuid.insert(uuid.to_string(), (account_id.to_string(), short_id));
        inner
            .by_short
            .insert((account_id.to_string(), short_id), uuid.to_string());
        inner.order.push_back(key.clone());
        inner.entries.insert(key, entry);

        while inner.order.len() > REPLY_CACHE_MAX {
            if let Some(oldest) = inner.order.pop_front() {
                if let Some(evicted) = inner.entries.remove(&oldest) {
                    inner.by_uuid.remove(&evicted.uuid);
                    inner.by_short.remove(&(evicted.account_id.clone(), evicted.short_id));
                }
            }
        }

        short_id
    }

    /// Short id for a provider UUID, any account.
    pub fn short_id_for_uuid(&self, uuid: &str) -> Option<u32> {
        let inner = self.inner.lock().expect("reply cache poisoned");
        inner.by_uuid.get(uuid).map(|(_, short)| *short)
    }

    /// Resolve reply context for an inbound `replyToId`.
    ///
    /// Prefers the exact `(account, uuid)` entry; falls back to a short-id
    /// token, then to a chat-scoped scan across accounts (newest first).
    pub fn resolve_reply_context(
        &self,
        account_id: &str,
        reply_to_id: &str,
        chat: &ChatIds,
    ) -> Option<ReplyContext> {
        let inner = self.inner.lock().expect("reply cache poisoned");
        let key = (account_id.to_string(), reply_to_id.to_string());
        if let Some(entry) = inner.entries.get(&key) {
            return Some(context_of(entry));
        }

        if let Ok(short) = reply_to_id.trim().parse::<u32>() {
            if let Some(uuid) = inner.by_short.get(&(account_id.to_string(), short)) {
                let key = (account_id.to_string(), uuid.clone());
                if let Some(entry) = inner.entries.get(&key) {
                    return Some(context_of(entry));
                }
            }
        }

        // Chat-scoped fallback: the echo may arrive under a different account.
        inner
            .order
            .iter()
            .rev()
            .filter_map(|k| inner.entries.get(k))
            .find(|e| e.uuid == reply_to_id && (chat.is_empty() || e.chat.overlaps(chat)))
            .map(context_of)
    }

    /// Rehydrate a token that may be a short id or already a UUID.
    ///
    /// Unknown short ids return the empty string when `require_known_short_id`
    /// is set (never guess); otherwise the input passes through unchanged.
    pub fn resolve_message_id(
        &self,
        account_id: Option<&str>,
        input: &str,
        require_known_short_id: bool,
    ) -> String {
        let token = input.trim().trim_start_matches('[').trim_end_matches(']');
        if token.is_empty() {
            return String::new();
        }

        // Anything non-numeric is already a provider id.
        let Ok(short) = token.parse::<u32>() else {
            return token.to_string();
        };

        let inner = self.inner.lock().expect("reply cache poisoned");
        let uuid = match account_id {
            Some(account) => inner.by_short.get(&(account.to_string(), short)).cloned(),
            None => inner
                .order
                .iter()
                .rev()
                .filter_map(|k| inner.entries.get(k))
                .find(|e| e.short_id == short)
                .map(|e| e.uuid.clone()),
        };

        match uuid {
            Some(u) => u,
            None if require_known_short_id => String::new(),
            None => token.to_string(),
        }
    }
}

impl Default for ReplyCache {
    fn default() -> Self {
        Self::new()
    }
}

fn context_of(entry: &CacheEntry) -> ReplyContext {
    ReplyContext {
        short_id: entry.short_id,
        body: Some(entry.body.clone()),
        sender_label: Some(entry.sender_label.clone()),
    }
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
    fn remember_is_idempotent_per_account_uuid() {
        let cache = ReplyCache::new();
        let a = cache.remember("acct", "uuid-1", &chat("c1"), "Alice", "hi", 1);
        let b = cache.remember("acct", "uuid-1", &chat("c1"), "Alice", "hi again", 2);
        assert_eq!(a, b);
        let c = cache.remember("acct", "uuid-2", &chat("c1"), "Bob", "yo", 3);
        assert_ne!(a, c);
    }

    #[test]
    fn short_id_round_trip_is_identity() {
        let cache = ReplyCache::new();
        let short = cache.remember("acct", "uuid-9", &chat("c1"), "Alice", "hi", 1);
        let uuid = cache.resolve_message_id(Some("acct"), &short.to_string(), true);
        assert_eq!(uuid, "uuid-9");
        assert_eq!(cache.short_id_for_uuid(&uuid), Some(short));
    }

    #[test]
    fn unknown_short_id_with_require_returns_empty() {
        let cache = ReplyCache::new();
        assert_eq!(cache.resolve_message_id(Some("acct"), "77", true), "");
        assert_eq!(cache.resolve_message_id(Some("acct"), "77", false), "77");
    }

    #[test]
    fn uuid_like_tokens_pass_through() {
        let cache = ReplyCache::new();
        assert_eq!(
            cache.resolve_message_id(None, "ABCD-1234-EF", true),
            "ABCD-1234-EF"
        );
    }

    #[test]
    fn reply_context_matches_by_uuid_then_chat_fallback() {
        let cache = ReplyCache::new();
        cache.remember("acct", "uuid-1", &chat("c1"), "Alice", "original", 1);

        let direct = cache
            .resolve_reply_context("acct", "uuid-1", &chat("c1"))
            .unwrap();
        assert_eq!(direct.body.as_deref(), Some("original"));

        // Different account, same chat: fallback still resolves.
        let fallback = cache
            .resolve_reply_context("other", "uuid-1", &chat("c1"))
            .unwrap();
        assert_eq!(fallback.short_id, direct.short_id);
    }

    #[test]
    fn short_id_token_resolves_context() {
        let cache = ReplyCache::new();
        let short = cache.remember("acct", "uuid-5", &chat("c1"), "Alice", "hello", 1);
        let ctx = cache
            .resolve_reply_context("acct", &short.to_string(), &chat("c1"))
            .unwrap();
        assert_eq!(ctx.sender_label.as_deref(), Some("Alice"));
    }
}
