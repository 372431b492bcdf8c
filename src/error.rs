//! Error types shared by the session core.

use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for live session operations
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Media device error: {0}")]
    MediaDevice(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Other error: {0}")]
    Other(String),
}

impl LiveError {
    /// Failures that a reconnect cannot fix; `connect()` surfaces them and stops.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LiveError::Authentication(_) | LiveError::MediaDevice(_))
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
