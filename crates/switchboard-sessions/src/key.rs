//! Session-key algebra.
//!
//! Keys are `:`-delimited strings of the form `agent:<agentId>:<scope>` where
//! `<scope>` is `main`, `<channel>:direct:<peer>`, or
//! `<channel>:group:<group>[:topic:<n>][:thread:<id>]`. The algebra is
//! deterministic and idempotent: any surface spelling of the same logical
//! conversation derives the same key.

use switchboard_core::config::{IdentityLink, SwitchboardConfig};

use crate::error::{Result, SessionError};

/// Whether the peer side of a conversation is a single human or a group chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Direct,
    Group,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::Direct => "direct",
            PeerKind::Group => "group",
        }
    }
}

/// Inputs to [`build_agent_peer_session_key`].
#[derive(Debug, Clone)]
pub struct PeerSessionRequest<'a> {
    pub agent_id: &'a str,
    pub channel: &'a str,
    pub peer_kind: PeerKind,
    pub peer_id: &'a str,
    /// Topic / forum thread id on thread-per-topic providers (Telegram).
    pub thread_id: Option<&'a str>,
    /// Reply anchor on thread-per-reply providers (Slack).
    pub reply_to_id: Option<&'a str>,
}

/// Key of the agent's default implicit session: `agent:<id>:main`.
pub fn main_session_key(agent_id: &str) -> String {
    format!("agent:{}:main", agent_id.trim())
}

/// Derive the stable session key for a peer conversation.
///
/// Normalization applied, in order:
/// 1. trim all inputs; lower-case the peer id,
/// 2. fold `group:` / `<channel>:` prefixes on the peer id into the kind,
/// 3. strip BlueBubbles `chat_guid:` / `chat_identifier:` / `chat_id:`
///    prefixes down to the bare lower-cased identifier,
/// 4. rewrite `(channel, peer)` through identity links when configured,
/// 5. promote Slack `G…` / mpim-listed channel ids to group scope,
/// 6. append `:topic:<id>` (Telegram) or `:thread:<id>` (Slack) suffixes.
pub fn build_agent_peer_session_key(
    cfg: &SwitchboardConfig,
    req: &PeerSessionRequest<'_>,
) -> Result<String> {
    let agent_id = req.agent_id.trim();
    let mut channel = req.channel.trim().to_lowercase();
    if agent_id.is_empty() || channel.is_empty() {
        return Err(SessionError::InvalidPeerFormat(
            "agent and channel must be non-empty".to_string(),
        ));
    }

    let mut kind = req.peer_kind;
    let mut peer = req.peer_id.trim().to_lowercase();

    // Fold explicit kind/channel prefixes spelled into the peer id.
    if let Some(rest) = peer.strip_prefix("group:") {
        kind = PeerKind::Group;
        peer = rest.trim().to_string();
    }
    if let Some(rest) = peer.strip_prefix(&format!("{channel}:")) {
        peer = rest.trim().to_string();
    }

    // BlueBubbles chat-identifier triad prefixes all collapse to the bare id.
    for prefix in ["chat_guid:", "chat_identifier:", "chat_id:"] {
        if let Some(rest) = peer.strip_prefix(prefix) {
            peer = rest.trim().to_string();
            break;
        }
    }

    if peer.is_empty() {
        return Err(SessionError::InvalidPeerFormat(format!(
            "empty peer id for channel {channel}"
        )));
    }

    // Identity links rewrite the surface identity into a shared logical peer.
    if let Some(link) = match_identity_link(&cfg.identity_links, &channel, &peer) {
        channel = link.channel.trim().to_lowercase();
        peer = link.logical.trim().to_lowercase();
    }

    // Slack: G-prefixed ids and configured mpim entries are multi-party.
    if channel == "slack" && kind == PeerKind::Direct {
        let mpim = cfg
            .channel("slack")
            .map(|c| c.mpim.as_slice())
            .unwrap_or_default();
        if peer.starts_with('g') || mpim.iter().any(|m| m.to_lowercase() == peer) {
            kind = PeerKind::Group;
        }
    }

    let mut key = format!("agent:{agent_id}:{channel}:{}:{peer}", kind.as_str());

    if kind == PeerKind::Group {
        match channel.as_str() {
            // Thread-per-topic providers carry a topic suffix.
            "telegram" => {
                if let Some(topic) = non_empty(req.thread_id) {
                    key.push_str(&format!(":topic:{topic}"));
                }
            }
            // Slack threads are keyed by the reply anchor.
            "slack" => {
                if let Some(thread) = non_empty(req.reply_to_id) {
                    key.push_str(&format!(":thread:{thread}"));
                }
            }
            _ => {}
        }
    } else if channel == "slack" {
        if let Some(thread) = non_empty(req.reply_to_id) {
            key.push_str(&format!(":thread:{thread}"));
        }
    }

    Ok(key)
}

fn non_empty<'a>(v: Option<&'a str>) -> Option<&'a str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

fn match_identity_link<'a>(
    links: &'a [IdentityLink],
    channel: &str,
    peer: &str,
) -> Option<&'a IdentityLink> {
    let surface = format!("{channel}:{peer}");
    links
        .iter()
        .find(|link| link.peers.iter().any(|p| p.to_lowercase() == surface))
}
