use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::{AgentId, MessagePayload};

/// Default bound on a single agent turn when the caller sets none.
pub const DEFAULT_TURN_TIMEOUT_SECS: u64 = 600;

/// Everything an agent turn needs to know about why it is running.
#[derive(Debug, Clone)]
pub struct AgentTurnRequest {
    pub agent_id: AgentId,
    pub session_key: String,
    /// The prompt or canonical inbound envelope handed to the model.
    pub message: String,
    pub model: Option<String>,
    pub thinking: Option<String>,
    /// Bound on the turn; callers apply a default when unset.
    pub timeout_seconds: Option<u64>,
    pub allow_unsafe_external_content: bool,
    /// Internal-only turns must not produce outbound deliveries; the caller
    /// discards payload text and only observes side effects.
    pub internal_only: bool,
}

impl AgentTurnRequest {
    pub fn new(agent_id: AgentId, session_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_id,
            session_key: session_key.into(),
            message: message.into(),
            model: None,
            thinking: None,
            timeout_seconds: None,
            allow_unsafe_external_content: false,
            internal_only: false,
        }
    }
}

/// The opaque language-model collaborator. The messaging core never looks
/// inside a turn; it hands over a request and receives reply payloads.
///
/// Implementations must honour `abort`: a cancelled token means the caller
/// has given up (timeout or shutdown) and the turn should stop promptly.
#[async_trait]
pub trait AgentTurnDriver: Send + Sync {
    async fn run_turn(
        &self,
        request: AgentTurnRequest,
        abort: CancellationToken,
    ) -> crate::Result<Vec<MessagePayload>>;
}
