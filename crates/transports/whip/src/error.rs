//! Error types for WHIP ingest

/// Result type alias using WHIP ingest Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating, admitting or running a session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or unparseable SDP, wrong media type or oversized body
    #[error("Invalid offer: {0}")]
    InvalidOffer(String),

    /// Offer shares no codec with the configured allow-list
    #[error("No compatible codec: {0}")]
    NoCompatibleCodec(String),

    /// Registry is at its concurrent session limit
    #[error("Session capacity exceeded (limit {limit})")]
    CapacityExceeded { limit: usize },

    /// A transport resource (UDP port) could not be allocated
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// ICE/DTLS failure after admission
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session identifier already admitted
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// Registry no longer admits sessions
    #[error("Ingest is shutting down")]
    ShuttingDown,

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse error taxonomy surfaced to the HTTP layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidOffer,
    NoCompatibleCodec,
    CapacityExceeded,
    ResourceExhausted,
    TransportFailure,
    InternalError,
}

impl ErrorKind {
    /// HTTP status code the surrounding server answers with
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::InvalidOffer => 400,
            ErrorKind::NoCompatibleCodec => 422,
            ErrorKind::CapacityExceeded | ErrorKind::ResourceExhausted => 503,
            ErrorKind::TransportFailure | ErrorKind::InternalError => 500,
        }
    }
}

impl Error {
    /// Map this error onto the ingest error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidOffer(_) => ErrorKind::InvalidOffer,
            Error::NoCompatibleCodec(_) => ErrorKind::NoCompatibleCodec,
            Error::CapacityExceeded { .. } | Error::ShuttingDown => ErrorKind::CapacityExceeded,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::TransportFailure(_) | Error::WebRtcError(_) => ErrorKind::TransportFailure,
            Error::InvalidConfig(_)
            | Error::SessionNotFound(_)
            | Error::SessionExists(_)
            | Error::InternalError(_)
            | Error::IoError(_)
            | Error::Other(_) => ErrorKind::InternalError,
        }
    }

    /// Status code for this error, see [`ErrorKind::status_code`]
    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    /// Check if the client may retry the same request with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CapacityExceeded | ErrorKind::ResourceExhausted
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}
