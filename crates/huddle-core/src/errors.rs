use thiserror::Error;

use crate::peer::PeerConnectionState;

#[derive(Debug, Error)]
pub enum RoomError {
    /// Signaling handshake or auth failure. Fatal to a connect attempt.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Malformed SDP or negotiation payload.
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: PeerConnectionState,
        to: PeerConnectionState,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("channel not ready: {0}")]
    ChannelNotReady(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RoomError {
    /// Whether a caller may retry the failed operation as-is.
    ///
    /// `InvalidArgument` and `InvalidTransition` never succeed on retry;
    /// `Connection` needs a fresh connect attempt rather than a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RoomError::Signaling(_)
                | RoomError::ChannelNotReady(_)
                | RoomError::Timeout(_)
                | RoomError::Http(_)
        )
    }
}

impl From<reqwest::Error> for RoomError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RoomError::Timeout(e.to_string())
        } else {
            RoomError::Http(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RoomError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RoomError::Connection(e.to_string())
    }
}
