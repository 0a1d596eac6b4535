use switchboard_core::config::SwitchboardConfig;
use switchboard_sessions::{build_agent_peer_session_key, PeerKind, PeerSessionRequest};

use crate::error::{Result, RoutingError};

/// Where an outbound send lands and which session it is mirrored into.
#[derive(Debug, Clone)]
pub struct OutboundRoute {
    pub session_key: String,
    /// The provider-level destination after parsing (bare handle, chat id…).
    pub to: String,
    pub thread_id: Option<String>,
    pub chat_kind: PeerKind,
}

/// Compute the session an outbound delivery belongs to.
///
/// `target` is the caller's destination expression; `resolved_target` is the
/// directory-resolved form when the caller only had a fuzzy name. Channel
/// rules:
///
/// | Channel | Behaviour |
/// |---|---|
/// | telegram | `:topic:<n>` suffix becomes the thread id and promotes the key |
/// | slack | `reply_to_id` promotes the key to `…:thread:<ts>`; mpim ids flip to group |
/// | bluebubbles | `chat_guid:`-style prefixes are stripped, token lower-cased |
/// | whatsapp | lower-cased, `whatsapp:` prefix stripped, `@g.us` means group |
pub fn resolve_outbound_session_route(
    cfg: &SwitchboardConfig,
    channel: &str,
    agent_id: &str,
    _account_id: Option<&str>,
    target: &str,
    resolved_target: Option<&str>,
    reply_to_id: Option<&str>,
    thread_id: Option<&str>,
) -> Result<OutboundRoute> {
    let channel_lower = channel.trim().to_lowercase();
    let raw = resolved_target.unwrap_or(target).trim();
    if raw.is_empty() {
        return Err(RoutingError::InvalidTarget {
            channel: channel_lower,
            target: target.to_string(),
        });
    }

    let mut to = raw.to_string();
    let mut kind = PeerKind::Direct;
    let mut thread = thread_id.map(str::to_string);

    match channel_lower.as_str() {
        "telegram" => {
            // "-100123:topic:7" → peer -100123, thread 7.
            if let Some((peer, topic)) = raw.split_once(":topic:") {
                to = peer.to_string();
                thread = Some(topic.to_string());
            }
            if to.starts_with('-') || to.to_lowercase().starts_with("group:") {
                kind = PeerKind::Group;
            }
        }
        "slack" => {
            let upper = to.to_uppercase();
            if upper.starts_with('C') || upper.starts_with('G') {
                kind = PeerKind::Group;
            }
            let mpim = cfg
                .channel("slack")
                .map(|c| c.mpim.as_slice())
                .unwrap_or_default();
            if mpim.iter().any(|m| m.eq_ignore_ascii_case(&to)) {
                kind = PeerKind::Group;
            }
        }
        "bluebubbles" => {
            to = to.to_lowercase();
            for prefix in ["chat_guid:", "chat_identifier:", "chat_id:"] {
                if let Some(rest) = to.strip_prefix(prefix) {
                    to = rest.to_string();
                    break;
                }
            }
            // iMessage group guids carry ";+;".
            if to.contains(";+;") || to.starts_with("chat") {
                kind = PeerKind::Group;
            }
        }
        "whatsapp" => {
            to = to.to_lowercase();
            if let Some(rest) = to.strip_prefix("whatsapp:") {
                to = rest.to_string();
            }
            if to.ends_with("@g.us") {
                kind = PeerKind::Group;
            }
        }
        _ => {
            if let Some(rest) = to.to_lowercase().strip_prefix("group:") {
                to = rest.to_string();
                kind = PeerKind::Group;
            }
        }
    }

    let session_key = build_agent_peer_session_key(
        cfg,
        &PeerSessionRequest {
            agent_id,
            channel: &channel_lower,
            peer_kind: kind,
            peer_id: &to,
            thread_id: thread.as_deref(),
            reply_to_id,
        },
    )?;

    Ok(OutboundRoute {
        session_key,
        to,
        thread_id: thread,
        chat_kind: kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_topic_target_promotes_key() {
        let cfg = SwitchboardConfig::default();
        let route = resolve_outbound_session_route(
            &cfg,
            "telegram",
            "main",
            None,
            "-100555:topic:9",
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(route.to, "-100555");
        assert_eq!(route.thread_id.as_deref(), Some("9"));
        assert_eq!(route.session_key, "agent:main:telegram:group:-100555:topic:9");
    }

    #[test]
    fn slack_reply_promotes_to_thread() {
        let cfg = SwitchboardConfig::default();
        let route = resolve_outbound_session_route(
            &cfg,
            "slack",
            "main",
            None,
            "C0AAA",
            None,
            Some("1712.0001"),
            None,
        )
        .unwrap();
        assert!(route.session_key.ends_with(":thread:1712.0001"));
    }

    #[test]
    fn slack_mpim_entry_flips_to_group() {
        let mut cfg = SwitchboardConfig::default();
        cfg.channels.insert(
            "slack".into(),
            switchboard_core::config::ChannelConfig {
                mpim: vec!["D0MPIM".into()],
                ..Default::default()
            },
        );
        let route = resolve_outbound_session_route(
            &cfg, "slack", "main", None, "D0MPIM", None, None, None,
        )
        .unwrap();
        assert_eq!(route.chat_kind, PeerKind::Group);
    }

    #[test]
    fn bluebubbles_prefix_stripped_and_lowercased() {
        let cfg = SwitchboardConfig::default();
        let route = resolve_outbound_session_route(
            &cfg,
            "bluebubbles",
            "main",
            None,
            "chat_guid:iMessage;-;+15550001111",
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(route.to, "imessage;-;+15550001111");
        assert_eq!(route.chat_kind, PeerKind::Direct);
    }

    #[test]
    fn whatsapp_group_jid_detected() {
        let cfg = SwitchboardConfig::default();
        let route = resolve_outbound_session_route(
            &cfg,
            "whatsapp",
            "main",
            None,
            "whatsapp:1203633@G.US",
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(route.to, "1203633@g.us");
        assert_eq!(route.chat_kind, PeerKind::Group);
    }

    #[test]
    fn empty_target_is_invalid() {
        let cfg = SwitchboardConfig::default();
        assert!(resolve_outbound_session_route(
            &cfg, "telegram", "main", None, "  ", None, None, None
        )
        .is_err());
    }
}
