use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Peer or key components are malformed (empty agent/channel/peer).
    #[error("Invalid peer format: {0}")]
    InvalidPeerFormat(String),

    #[error("Session store I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Session store corrupt at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidPeerFormat(_) => "INVALID_PEER_FORMAT",
            SessionError::Io { .. } => "IO_ERROR",
            SessionError::Corrupt { .. } => "STORE_CORRUPT",
            SessionError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
