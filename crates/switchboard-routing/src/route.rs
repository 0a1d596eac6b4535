use switchboard_core::config::SwitchboardConfig;
use switchboard_core::types::AgentId;
use switchboard_sessions::{build_agent_peer_session_key, PeerKind, PeerSessionRequest};

use crate::error::Result;

/// Parsed peer side of an inbound event, channel-agnostic.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub kind: PeerKind,
    pub id: String,
    pub thread_id: Option<String>,
    pub reply_to_id: Option<String>,
}

impl PeerInfo {
    pub fn direct(id: impl Into<String>) -> Self {
        Self {
            kind: PeerKind::Direct,
            id: id.into(),
            thread_id: None,
            reply_to_id: None,
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self {
            kind: PeerKind::Group,
            id: id.into(),
            thread_id: None,
            reply_to_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub agent_id: AgentId,
    pub session_key: String,
}

/// Pick the agent for an inbound conversation and derive its session key.
///
/// Routing rules are most-specific-wins: a rule naming channel + account +
/// peer beats channel + account, which beats channel alone. Ties go to the
/// earlier rule. With no match the default agent answers.
pub fn resolve_agent_route(
    cfg: &SwitchboardConfig,
    channel: &str,
    account_id: Option<&str>,
    peer: &PeerInfo,
) -> Result<ResolvedRoute> {
    let peer_lower = peer.id.trim().to_lowercase();
    let mut best: Option<(usize, &str)> = None;

    for rule in &cfg.routing {
        let mut specificity = 0usize;
        if let Some(rc) = &rule.channel {
            if !rc.eq_ignore_ascii_case(channel) {
                continue;
            }
            specificity += 1;
        }
        if let Some(ra) = &rule.account_id {
            if account_id.map(|a| a.eq_ignore_ascii_case(ra)) != Some(true) {
                continue;
            }
            specificity += 1;
        }
        if let Some(rp) = &rule.peer {
            if rp.to_lowercase() != peer_lower {
                continue;
            }
            specificity += 1;
        }
        if best.map(|(s, _)| specificity > s).unwrap_or(true) {
            best = Some((specificity, rule.agent.as_str()));
        }
    }

    let agent = best
        .map(|(_, a)| a.to_string())
        .unwrap_or_else(|| cfg.agents.default.clone());

    let session_key = build_agent_peer_session_key(
        cfg,
        &PeerSessionRequest {
            agent_id: &agent,
            channel,
            peer_kind: peer.kind,
            peer_id: &peer.id,
            thread_id: peer.thread_id.as_deref(),
            reply_to_id: peer.reply_to_id.as_deref(),
        },
    )?;

    Ok(ResolvedRoute {
        agent_id: AgentId(agent),
        session_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::config::RouteRule;

    #[test]
    fn default_agent_when_no_rules() {
        let cfg = SwitchboardConfig::default();
        let route =
            resolve_agent_route(&cfg, "telegram", None, &PeerInfo::direct("12345")).unwrap();
        assert_eq!(route.agent_id.as_str(), "main");
        assert_eq!(route.session_key, "agent:main:telegram:direct:12345");
    }

    #[test]
    fn most_specific_rule_wins() {
        let mut cfg = SwitchboardConfig::default();
        cfg.routing = vec![
            RouteRule {
                channel: Some("telegram".into()),
                account_id: None,
                peer: None,
                agent: "general".into(),
            },
            RouteRule {
                channel: Some("telegram".into()),
                account_id: Some("bot-a".into()),
                peer: Some("12345".into()),
                agent: "vip".into(),
            },
        ];
        let route = resolve_agent_route(
            &cfg,
            "telegram",
            Some("bot-a"),
            &PeerInfo::direct("12345"),
        )
        .unwrap();
        assert_eq!(route.agent_id.as_str(), "vip");

        let other = resolve_agent_route(
            &cfg,
            "telegram",
            Some("bot-a"),
            &PeerInfo::direct("99999"),
        )
        .unwrap();
        assert_eq!(other.agent_id.as_str(), "general");
    }

    #[test]
    fn rule_for_other_channel_is_skipped() {
        let mut cfg = SwitchboardConfig::default();
        cfg.routing = vec![RouteRule {
            channel: Some("discord".into()),
            account_id: None,
            peer: None,
            agent: "discord-agent".into(),
        }];
        let route = resolve_agent_route(&cfg, "telegram", None, &PeerInfo::direct("1")).unwrap();
        assert_eq!(route.agent_id.as_str(), "main");
    }
}
