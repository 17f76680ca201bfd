//! Error types.

use core::fmt;

/// Errors surfaced by the multiplexer.
#[derive(Debug)]
pub enum MuxError {
    /// The connection closed before the matching response arrived, or a
    /// request was issued after the connection reached a terminal state.
    ConnectionClosed,
    /// The connection failed to open.
    Connect(String),
    /// The peer answered the request with an `error` field.
    Remote(String),
    /// The request failed to serialize.
    Encode(serde_json::Error),
    /// The pending-request table is at capacity.
    TooManyPending,
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Connect(reason) => write!(f, "connection failed: {reason}"),
            Self::Remote(message) => write!(f, "remote error: {message}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::TooManyPending => write!(f, "too many pending requests"),
        }
    }
}

impl std::error::Error for MuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for MuxError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e)
    }
}
