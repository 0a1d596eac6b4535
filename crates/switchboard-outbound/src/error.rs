use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboundError {
    /// Network, rate limit, 5xx — safe to retry.
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// Chat gone, bot blocked — retrying cannot help.
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),

    /// No adapter is registered for the channel. The message matches the
    /// permanent-error classifier so queue entries fail fast.
    #[error("Outbound not configured for channel: {0}")]
    NotConfigured(String),

    /// The adapter does not implement `send_payload`.
    #[error("Channel {0} does not support rich payloads")]
    PayloadUnsupported(String),

    #[error("Delivery aborted")]
    Aborted,

    #[error("Queue I/O error at {path}: {source}")]
    QueueIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OutboundError {
    pub fn code(&self) -> &'static str {
        match self {
            OutboundError::Transient(_) => "TRANSIENT_DELIVERY_FAILURE",
            OutboundError::Permanent(_) => "PERMANENT_DELIVERY_FAILURE",
            OutboundError::NotConfigured(_) => "OUTBOUND_NOT_CONFIGURED",
            OutboundError::PayloadUnsupported(_) => "PAYLOAD_UNSUPPORTED",
            OutboundError::Aborted => "ABORTED",
            OutboundError::QueueIo { .. } => "QUEUE_IO_ERROR",
            OutboundError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, OutboundError>;
