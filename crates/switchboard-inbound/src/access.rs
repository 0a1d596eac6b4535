//! DM / group policy evaluation.
//!
//! Deny-by-default where it matters: an allowlist policy with an empty list
//! blocks everything, and the block reason carries enough detail for the log
//! to print the exact config line that would unblock the sender.

use switchboard_core::config::{DmPolicy, GroupPolicy};

/// Why a message was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    DmPolicyDisabled,
    DmPolicyAllowlist,
    GroupPolicyDisabled,
    /// `group_policy=allowlist` with an empty allowlist.
    GroupAllowlistEmpty,
    /// The chat is not in a non-empty group allowlist.
    GroupNotAllowlisted,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::DmPolicyDisabled => "dmPolicy=disabled",
            BlockReason::DmPolicyAllowlist => "dmPolicy=allowlist",
            BlockReason::GroupPolicyDisabled => "groupPolicy=disabled",
            BlockReason::GroupAllowlistEmpty => "groupPolicy=allowlist (empty allowlist)",
            BlockReason::GroupNotAllowlisted => "groupPolicy=allowlist (not allowlisted)",
        }
    }
}

/// Outcome of the policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    /// Unknown DM sender under `dm_policy=pairing`: start the handshake.
    Pairing,
    Block(BlockReason),
}

/// Inputs to [`resolve_dm_group_access_decision`], precomputed by the caller.
#[derive(Debug, Clone)]
pub struct AccessQuery<'a> {
    pub is_group: bool,
    pub dm_policy: DmPolicy,
    pub group_policy: GroupPolicy,
    pub effective_allow_from: &'a [String],
    pub effective_group_allow_from: &'a [String],
    pub is_sender_allowed: bool,
    pub is_group_allowed: bool,
}

/// Evaluate the DM/group gate. Pure function of its inputs.
pub fn resolve_dm_group_access_decision(q: &AccessQuery<'_>) -> AccessDecision {
    if q.is_group {
        return match q.group_policy {
            GroupPolicy::Disabled => AccessDecision::Block(BlockReason::GroupPolicyDisabled),
            GroupPolicy::Open => AccessDecision::Allow,
            GroupPolicy::Allowlist => {
                if q.effective_group_allow_from.is_empty() {
                    AccessDecision::Block(BlockReason::GroupAllowlistEmpty)
                } else if !q.is_group_allowed {
                    AccessDecision::Block(BlockReason::GroupNotAllowlisted)
                } else {
                    AccessDecision::Allow
                }
            }
        };
    }

    match q.dm_policy {
        DmPolicy::Disabled => AccessDecision::Block(BlockReason::DmPolicyDisabled),
        DmPolicy::Open => AccessDecision::Allow,
        DmPolicy::Allowlist => {
            if q.is_sender_allowed {
                AccessDecision::Allow
            } else {
                AccessDecision::Block(BlockReason::DmPolicyAllowlist)
            }
        }
        DmPolicy::Pairing => {
            if q.is_sender_allowed {
                AccessDecision::Allow
            } else {
                AccessDecision::Pairing
            }
        }
    }
}

/// Allowlist matching: `"*"` is a wildcard, entries may carry a leading `@`.
pub fn list_matches(list: &[String], value: &str) -> bool {
    if list.is_empty() {
        return false;
    }
    let bare = value.trim().trim_start_matches('@');
    list.iter().any(|entry| {
        let entry = entry.trim().trim_start_matches('@');
        entry == "*" || entry.eq_ignore_ascii_case(bare)
    })
}

/// The exact config line that would allowlist a blocked group chat, surfaced
/// in the verbose drop log so operators can copy it verbatim.
pub fn group_allowlist_hint(channel: &str, chat_token: &str) -> String {
    format!("channels.{channel}.groupAllowFrom=[\"{chat_token}\"]")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query<'a>(
        is_group: bool,
        dm: DmPolicy,
        group: GroupPolicy,
        group_list: &'a [String],
        sender_ok: bool,
        group_ok: bool,
    ) -> AccessQuery<'a> {
        AccessQuery {
            is_group,
            dm_policy: dm,
            group_policy: group,
            effective_allow_from: &[],
            effective_group_allow_from: group_list,
            is_sender_allowed: sender_ok,
            is_group_allowed: group_ok,
        }
    }

    #[test]
    fn dm_disabled_blocks() {
        let d = resolve_dm_group_access_decision(&query(
            false,
            DmPolicy::Disabled,
            GroupPolicy::Open,
            &[],
            true,
            true,
        ));
        assert_eq!(d, AccessDecision::Block(BlockReason::DmPolicyDisabled));
    }

    #[test]
    fn dm_pairing_unknown_sender_starts_handshake() {
        let d = resolve_dm_group_access_decision(&query(
            false,
            DmPolicy::Pairing,
            GroupPolicy::Open,
            &[],
            false,
            false,
        ));
        assert_eq!(d, AccessDecision::Pairing);
    }

    #[test]
    fn dm_pairing_known_sender_allowed() {
        let d = resolve_dm_group_access_decision(&query(
            false,
            DmPolicy::Pairing,
            GroupPolicy::Open,
            &[],
            true,
            false,
        ));
        assert_eq!(d, AccessDecision::Allow);
    }

    #[test]
    fn group_allowlist_distinguishes_empty_from_miss() {
        let empty = resolve_dm_group_access_decision(&query(
            true,
            DmPolicy::Open,
            GroupPolicy::Allowlist,
            &[],
            true,
            false,
        ));
        assert_eq!(empty, AccessDecision::Block(BlockReason::GroupAllowlistEmpty));

        let list = vec!["other-chat".to_string()];
        let miss = resolve_dm_group_access_decision(&query(
            true,
            DmPolicy::Open,
            GroupPolicy::Allowlist,
            &list,
            true,
            false,
        ));
        assert_eq!(miss, AccessDecision::Block(BlockReason::GroupNotAllowlisted));

        let hit = resolve_dm_group_access_decision(&query(
            true,
            DmPolicy::Open,
            GroupPolicy::Allowlist,
            &list,
            true,
            true,
        ));
        assert_eq!(hit, AccessDecision::Allow);
    }

    #[test]
    fn list_matching_rules() {
        let list = vec!["@Alice".to_string(), "123".to_string()];
        assert!(list_matches(&list, "alice"));
        assert!(list_matches(&list, "@alice"));
        assert!(list_matches(&list, "123"));
        assert!(!list_matches(&list, "bob"));
        assert!(!list_matches(&[], "anyone"));
        assert!(list_matches(&["*".to_string()], "anyone"));
    }

    #[test]
    fn hint_is_exact_config_line() {
        assert_eq!(
            group_allowlist_hint("bluebubbles", "imessage;+;chat123"),
            "channels.bluebubbles.groupAllowFrom=[\"imessage;+;chat123\"]"
        );
    }
}
