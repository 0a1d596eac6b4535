use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeartbeatError {
    /// An explicit delivery target is not in the configured allowlist.
    /// There is no silent fallback to `last`.
    #[error("Heartbeat target not allowed: {0}")]
    TargetNotAllowed(String),

    #[error("Heartbeat target malformed: {0}")]
    InvalidTarget(String),

    #[error(transparent)]
    Session(#[from] switchboard_sessions::SessionError),

    #[error(transparent)]
    Outbound(#[from] switchboard_outbound::OutboundError),

    #[error("Agent turn failed: {0}")]
    AgentTurn(String),
}

impl HeartbeatError {
    pub fn code(&self) -> &'static str {
        match self {
            HeartbeatError::TargetNotAllowed(_) => "TARGET_NOT_ALLOWED",
            HeartbeatError::InvalidTarget(_) => "INVALID_TARGET",
            HeartbeatError::Session(_) => "SESSION_ERROR",
            HeartbeatError::Outbound(_) => "OUTBOUND_ERROR",
            HeartbeatError::AgentTurn(_) => "AGENT_TURN_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, HeartbeatError>;
