use switchboard_core::config::HeartbeatConfig;
use switchboard_sessions::SessionEntry;

use crate::error::{HeartbeatError, Result};

/// Where a heartbeat's output should land. `channel: None` means the run is
/// internal-only and nothing is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatTarget {
    pub channel: Option<String>,
    pub to: Option<String>,
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
    /// Why delivery was suppressed, when it was.
    pub reason: Option<String>,
}

impl HeartbeatTarget {
    fn none(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

/// Resolve the heartbeat delivery target.
///
/// Precedence: the caller's explicit target expression, then the configured
/// one. `"none"` is always honoured. `"last"` follows the session's last
/// route unless that route is webchat (ephemeral, nothing to deliver to).
/// Any explicit `channel:to` expression must appear in `allowed_targets` —
/// a miss is an error, never a silent fallback to `last`.
pub fn resolve_heartbeat_delivery_target(
    hb: &HeartbeatConfig,
    session: Option<&SessionEntry>,
    explicit: Option<&str>,
) -> Result<HeartbeatTarget> {
    let expr = explicit.unwrap_or(hb.target.as_str()).trim();

    match expr {
        "none" | "" => Ok(HeartbeatTarget::none("target none")),
        "last" => Ok(last_route_target(session)),
        _ => explicit_target(hb, expr),
    }
}

fn last_route_target(session: Option<&SessionEntry>) -> HeartbeatTarget {
    let Some(entry) = session else {
        return HeartbeatTarget::none("no session entry for last route");
    };
    let Some(channel) = entry.last_channel.clone() else {
        return HeartbeatTarget::none("session has no last channel");
    };
    if channel == "webchat" {
        return HeartbeatTarget::none("last route is webchat");
    }
    HeartbeatTarget {
        channel: Some(channel),
        to: entry.last_to.clone(),
        account_id: entry.last_account_id.clone(),
        thread_id: None,
        reason: None,
    }
}

fn explicit_target(hb: &HeartbeatConfig, expr: &str) -> Result<HeartbeatTarget> {
    if !hb
        .allowed_targets
        .iter()
        .any(|t| t.trim().eq_ignore_ascii_case(expr))
    {
        return Err(HeartbeatError::TargetNotAllowed(expr.to_string()));
    }

    let (channel, rest) = expr
        .split_once(':')
        .ok_or_else(|| HeartbeatError::InvalidTarget(expr.to_string()))?;
    let channel = channel.trim().to_lowercase();
    let mut to = rest.trim().to_string();
    let mut thread_id = None;

    match channel.as_str() {
        "telegram" => {
            // ":topic:<n>" suffix becomes the thread id.
            if let Some((peer, topic)) = to.split_once(":topic:") {
                thread_id = Some(topic.to_string());
                to = peer.to_string();
            }
        }
        "whatsapp" => {
            to = to.to_lowercase();
            if let Some(stripped) = to.strip_prefix("whatsapp:") {
                to = stripped.to_string();
            }
        }
        _ => {}
    }

    if to.is_empty() {
        return Err(HeartbeatError::InvalidTarget(expr.to_string()));
    }

    Ok(HeartbeatTarget {
        channel: Some(channel),
        to: Some(to),
        account_id: None,
        thread_id,
        reason: None,
    })
}
