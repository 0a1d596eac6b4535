//! Replay protection for cryptographically verified webhooks.
//!
//! A verified request is fingerprinted (provider idempotency token when
//! present, else a hash over url + signature + body) and cached. Seeing the
//! same fingerprint inside the window marks the request a replay: it is
//! acknowledged but produces no side effects.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use switchboard_core::types::now_ms;

/// How long fingerprints are remembered.
const REPLAY_WINDOW_MS: i64 = 10 * 60 * 1000;

pub struct ReplayCache {
    seen: Mutex<HashMap<String, i64>>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `fingerprint`; returns `true` when it was already seen inside
    /// the window (i.e. this request is a replay).
    pub fn check_and_remember(&self, fingerprint: &str) -> bool {
        let now = now_ms();
        let mut seen = self.seen.lock().expect("replay cache poisoned");
        seen.retain(|_, at| now - *at <= REPLAY_WINDOW_MS);
        seen.insert(fingerprint.to_string(), now).is_some()
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a fingerprint for a verified request.
///
/// Prefers the provider's idempotency token; otherwise hashes
/// `url + signature + body` (or `timestamp + signature + body` for
/// timestamp-signed schemes — pass the timestamp as `url`).
pub fn request_fingerprint(
    idempotency_token: Option<&str>,
    url_or_timestamp: &str,
    signature: &str,
    body: &[u8],
) -> String {
    if let Some(token) = idempotency_token.filter(|t| !t.is_empty()) {
        return format!("token:{token}");
    }
    let mut hasher = Sha256::new();
    hasher.update(url_or_timestamp.as_bytes());
    hasher.update(signature.as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_identical_request_is_replay() {
        let cache = ReplayCache::new();
        let fp = request_fingerprint(None, "https://x/w", "sig", b"body");
        assert!(!cache.check_and_remember(&fp));
        assert!(cache.check_and_remember(&fp));
    }

    #[test]
    fn idempotency_token_short_circuits_hashing() {
        let a = request_fingerprint(Some("evt_1"), "u1", "s1", b"b1");
        let b = request_fingerprint(Some("evt_1"), "u2", "s2", b"b2");
        assert_eq!(a, b);
    }

    #[test]
    fn different_bodies_fingerprint_differently() {
        let a = request_fingerprint(None, "u", "s", b"one");
        let b = request_fingerprint(None, "u", "s", b"two");
        assert_ne!(a, b);
    }
}
