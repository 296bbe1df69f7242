//! Error taxonomy for the feed client.

/// Errors that can occur while talking to the detection backend.
///
/// Only `NotConnected`, `QueueFull` and `Config` ever reach callers. Transport
/// failures are absorbed by the reconnect loop and malformed payloads are
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Connection refused, abrupt close, or any other network failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// `send` was called while the connection was not open.
    #[error("not connected")]
    NotConnected,

    /// `send` found the outbound queue full because the backend stopped reading.
    #[error("outbound queue full")]
    QueueFull,

    /// An inbound payload did not decode into a message shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Invalid or unreadable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FeedError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Transport(_) => "transport",
            Self::NotConnected => "not_connected",
            Self::QueueFull => "queue_full",
            Self::Malformed(_) => "malformed_message",
            Self::Config(_) => "config",
        }
    }

    /// Whether the reconnect loop recovers from this error on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<figment::Error> for FeedError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
