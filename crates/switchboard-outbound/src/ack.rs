//! Ack-reaction lifecycle.
//!
//! An accepted inbound message optionally gets an emoji reaction as a
//! "read/handling" receipt; after the reply is sent the reaction can be
//! removed again. Scope rules decide which messages qualify.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::warn;

use switchboard_core::config::AckScope;

use crate::adapter::{ChannelOutboundAdapter, SendContext};

/// Whether an accepted inbound message gets the ack reaction.
pub fn should_ack(
    scope: AckScope,
    is_group: bool,
    was_mentioned: bool,
    is_direct_mention: bool,
) -> bool {
    match scope {
        AckScope::Always => true,
        AckScope::GroupMentions => is_group && was_mentioned,
        AckScope::GroupDirectMentions => is_group && is_direct_mention,
        AckScope::Direct => !is_group,
    }
}

/// Applies and removes ack reactions, logging invalid emoji once per emoji.
pub struct AckReactor {
    warned: Mutex<HashSet<String>>,
}

impl AckReactor {
    pub fn new() -> Self {
        Self {
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Add the ack reaction to `message_id`. Failures are logged, never
    /// propagated; an invalid emoji is reported once and then ignored.
    pub async fn apply(
        &self,
        adapter: &dyn ChannelOutboundAdapter,
        ctx: &SendContext,
        message_id: &str,
        emoji: &str,
    ) {
        if !self.check_emoji(emoji) {
            return;
        }
        if let Err(e) = adapter.react(ctx, message_id, emoji, true).await {
            warn!(emoji, message_id, error = %e, "ack reaction add failed");
        }
    }

    /// Remove the ack reaction after the reply was sent.
    pub async fn remove(
        &self,
        adapter: &dyn ChannelOutboundAdapter,
        ctx: &SendContext,
        message_id: &str,
        emoji: &str,
    ) {
        if !self.check_emoji(emoji) {
            return;
        }
        if let Err(e) = adapter.react(ctx, message_id, emoji, false).await {
            warn!(emoji, message_id, error = %e, "ack reaction remove failed");
        }
    }

    fn check_emoji(&self, emoji: &str) -> bool {
        if is_plausible_emoji(emoji) {
            return true;
        }
        let mut warned = self.warned.lock().expect("ack warn set poisoned");
        if warned.insert(emoji.to_string()) {
            warn!(emoji, "invalid ack reaction emoji, skipping");
        }
        false
    }
}

impl Default for AckReactor {
    fn default() -> Self {
        Self::new()
    }
}

fn is_plausible_emoji(emoji: &str) -> bool {
    let trimmed = emoji.trim();
    !trimmed.is_empty()
        && trimmed.chars().count() <= 8
        && !trimmed.chars().any(|c| c.is_whitespace() || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_rules() {
        assert!(should_ack(AckScope::Always, true, false, false));
        assert!(should_ack(AckScope::Direct, false, false, false));
        assert!(!should_ack(AckScope::Direct, true, true, true));
        assert!(should_ack(AckScope::GroupMentions, true, true, false));
        assert!(!should_ack(AckScope::GroupMentions, true, false, false));
        assert!(should_ack(AckScope::GroupDirectMentions, true, true, true));
        assert!(!should_ack(AckScope::GroupDirectMentions, true, true, false));
    }

    #[test]
    fn emoji_plausibility() {
        assert!(is_plausible_emoji("\u{1f440}"));
        assert!(!is_plausible_emoji(""));
        assert!(!is_plausible_emoji("not an emoji"));
    }
}
