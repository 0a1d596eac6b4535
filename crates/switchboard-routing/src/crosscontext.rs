use switchboard_core::config::{CrossContextMode, SwitchboardConfig};
use tracing::debug;

use crate::error::{Result, RoutingError};

/// How a cross-context send should be decorated, if it is allowed at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossContextOutcome {
    /// Text prefix disclosing the originating context, when disclosure mode
    /// applies and components are not preferred.
    pub disclosure: Option<String>,
    /// Attach a provider-native component block instead of a text marker.
    pub prefer_components: bool,
}

/// Evaluate the cross-context policy for a tool-initiated send.
///
/// A send within the invocation context (same channel, or no invocation
/// context at all) always passes untouched. Crossing channels is governed by
/// the configured mode; `deny` raises, `disclose` tags the message.
pub fn enforce_cross_context_policy(
    cfg: &SwitchboardConfig,
    invocation_channel: Option<&str>,
    target_channel: &str,
) -> Result<CrossContextOutcome> {
    let Some(origin) = invocation_channel else {
        return Ok(CrossContextOutcome::default());
    };
    if origin.eq_ignore_ascii_case(target_channel) {
        return Ok(CrossContextOutcome::default());
    }

    match cfg.cross_context.mode {
        CrossContextMode::Deny => Err(RoutingError::CrossContextDenied {
            from: origin.to_string(),
            to: target_channel.to_string(),
        }),
        CrossContextMode::Allow => {
            debug!(from = origin, to = target_channel, "cross-context send allowed");
            Ok(CrossContextOutcome::default())
        }
        CrossContextMode::Disclose => Ok(CrossContextOutcome {
            disclosure: if cfg.cross_context.prefer_components {
                None
            } else {
                Some(format!("[via {origin}] "))
            },
            prefer_components: cfg.cross_context.prefer_components,
        }),
    }
}
