use thiserror::Error;

#[derive(Debug, Error)]
pub enum InboundError {
    /// Malformed provider payload — the HTTP layer answers 400.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Recognised but unsupported event type — answered 200, not processed.
    #[error("Unsupported event type: {0}")]
    UnsupportedEvent(String),

    #[error("Attachment too large: {size} bytes (cap {cap})")]
    AttachmentTooLarge { size: u64, cap: u64 },

    #[error("Attachment fetch failed: {0}")]
    AttachmentFetch(String),

    #[error("History fetch failed: {0}")]
    HistoryFetch(String),

    #[error(transparent)]
    Routing(#[from] switchboard_routing::RoutingError),

    #[error(transparent)]
    Session(#[from] switchboard_sessions::SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl InboundError {
    pub fn code(&self) -> &'static str {
        match self {
            InboundError::InvalidPayload(_) => "INVALID_PAYLOAD",
            InboundError::UnsupportedEvent(_) => "UNSUPPORTED_EVENT",
            InboundError::AttachmentTooLarge { .. } => "ATTACHMENT_TOO_LARGE",
            InboundError::AttachmentFetch(_) => "ATTACHMENT_FETCH_FAILED",
            InboundError::HistoryFetch(_) => "HISTORY_FETCH_FAILED",
            InboundError::Routing(_) => "ROUTING_ERROR",
            InboundError::Session(_) => "SESSION_ERROR",
            InboundError::Io(_) => "IO_ERROR",
            InboundError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, InboundError>;
