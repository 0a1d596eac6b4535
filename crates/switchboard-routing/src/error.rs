use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Invalid outbound target {target:?} for channel {channel}")]
    InvalidTarget { channel: String, target: String },

    #[error("Cross-context send denied: {from} -> {to}")]
    CrossContextDenied { from: String, to: String },

    #[error(transparent)]
    Session(#[from] switchboard_sessions::SessionError),
}

impl RoutingError {
    pub fn code(&self) -> &'static str {
        match self {
            RoutingError::InvalidTarget { .. } => "INVALID_TARGET",
            RoutingError::CrossContextDenied { .. } => "CROSS_CONTEXT_DENIED",
            RoutingError::Session(_) => "SESSION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RoutingError>;
