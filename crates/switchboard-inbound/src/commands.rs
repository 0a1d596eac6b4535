//! Control-command gating.
//!
//! A control command is a `/word` prefix addressed to the gateway itself, not
//! the agent. Owners are always authorised; group-allowlisted senders are
//! authorised only when access groups are enabled. Unauthorised control
//! commands in groups are dropped.

/// True when `text` starts with a control command (`/status`, `/restart`, …).
pub fn contains_control_command(text: &str) -> bool {
    let trimmed = text.trim_start();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return false;
    };
    rest.chars()
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false)
}

/// Result of the command gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandGate {
    pub command_authorized: bool,
    /// The message carries a control command the sender may not issue;
    /// drop it instead of forwarding to the agent.
    pub should_block: bool,
}

/// Compute the command gate from sender standing and channel settings.
pub fn resolve_control_command_gate(
    has_control_command: bool,
    sender_is_owner: bool,
    sender_in_group_allowlist: bool,
    use_access_groups: bool,
    is_group: bool,
) -> CommandGate {
    let command_authorized =
        sender_is_owner || (use_access_groups && sender_in_group_allowlist);
    CommandGate {
        command_authorized,
        should_block: has_control_command && !command_authorized && is_group,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_slash_word() {
        assert!(contains_control_command("/status"));
        assert!(contains_control_command("  /restart now"));
        assert!(!contains_control_command("hello /status"));
        assert!(!contains_control_command("/5 things"));
        assert!(!contains_control_command("5/3"));
    }

    #[test]
    fn owner_is_always_authorized() {
        let gate = resolve_control_command_gate(true, true, false, false, true);
        assert!(gate.command_authorized);
        assert!(!gate.should_block);
    }

    #[test]
    fn group_allowlist_counts_only_with_access_groups() {
        let without = resolve_control_command_gate(true, false, true, false, true);
        assert!(!without.command_authorized);
        assert!(without.should_block);

        let with = resolve_control_command_gate(true, false, true, true, true);
        assert!(with.command_authorized);
        assert!(!with.should_block);
    }

    #[test]
    fn unauthorized_dm_command_passes_gate() {
        // Only group messages are dropped for unauthorised commands.
        let gate = resolve_control_command_gate(true, false, false, false, false);
        assert!(!gate.command_authorized);
        assert!(!gate.should_block);
    }
}
