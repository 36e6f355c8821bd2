//! Error types for c8y-realtime.

use thiserror::Error;

/// Main error type for all realtime client operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Subscription pattern could not be compiled.
    #[error("invalid subscription pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Server rejected the handshake or omitted the client id.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Socket-level read/write failure.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Server payload could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Operation needs an established session.
    #[error("not connected")]
    NotConnected,

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization error (outbound frames).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Writer or worker has already shut down.
    #[error("connection closed")]
    ConnectionClosed,
}

impl RealtimeError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<url::ParseError> for RealtimeError {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("invalid URL: {}", err))
    }
}

/// Result type alias using RealtimeError.
pub type Result<T> = std::result::Result<T, RealtimeError>;
