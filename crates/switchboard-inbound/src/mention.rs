//! Mention gating for group messages.

use regex::Regex;
use tracing::warn;

use crate::commands::contains_control_command;

/// Compiled mention patterns for one channel.
///
/// No patterns means no mention requirement — every group message passes.
pub struct MentionGate {
    regexes: Vec<Regex>,
}

impl MentionGate {
    /// Compile `patterns`, skipping (and logging) invalid ones.
    pub fn new(patterns: &[String]) -> Self {
        let regexes = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "invalid mention pattern skipped");
                    None
                }
            })
            .collect();
        Self { regexes }
    }

    pub fn requires_mention(&self) -> bool {
        !self.regexes.is_empty()
    }

    pub fn is_mentioned(&self, text: &str) -> bool {
        self.regexes.iter().any(|re| re.is_match(text))
    }

    /// Should a group message be processed at all?
    ///
    /// Yes when (a) no mention requirement is configured, (b) the text
    /// matches a mention pattern, or (c) the sender is command-authorised and
    /// the text carries a control command (bypass rule).
    pub fn should_process_group_message(&self, text: &str, command_authorized: bool) -> bool {
        if !self.requires_mention() {
            return true;
        }
        if self.is_mentioned(text) {
            return true;
        }
        command_authorized && contains_control_command(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_patterns_means_no_requirement() {
        let gate = MentionGate::new(&[]);
        assert!(gate.should_process_group_message("anything", false));
    }

    #[test]
    fn mention_match_passes() {
        let gate = MentionGate::new(&[r"(?i)@assistant\b".to_string()]);
        assert!(gate.should_process_group_message("hey @Assistant what's up", false));
        assert!(!gate.should_process_group_message("no mention here", false));
    }

    #[test]
    fn authorized_command_bypasses_mention() {
        let gate = MentionGate::new(&[r"@assistant".to_string()]);
        assert!(gate.should_process_group_message("/status", true));
        assert!(!gate.should_process_group_message("/status", false));
    }

    #[test]
    fn invalid_pattern_is_skipped() {
        let gate = MentionGate::new(&["[unclosed".to_string(), "@bot".to_string()]);
        assert!(gate.is_mentioned("ping @bot"));
    }
}
