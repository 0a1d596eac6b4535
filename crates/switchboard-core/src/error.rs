use thiserror::Error;

/// Error kinds shared across the messaging core. Component crates wrap or
/// extend these with their own enums; this one covers the kinds that cross
/// crate boundaries.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid peer format: {0}")]
    InvalidPeerFormat(String),

    #[error("Agent turn failed: {0}")]
    AgentTurn(String),

    #[error("Operation aborted")]
    Aborted,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable discriminant string for structured logs and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidPayload(_) => "INVALID_PAYLOAD",
            CoreError::Unauthorized(_) => "UNAUTHORIZED",
            CoreError::InvalidPeerFormat(_) => "INVALID_PEER_FORMAT",
            CoreError::AgentTurn(_) => "AGENT_TURN_FAILED",
            CoreError::Aborted => "ABORTED",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
            CoreError::Io(_) => "IO_ERROR",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
