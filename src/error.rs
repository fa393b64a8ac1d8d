//! Error types for amqwire.

use thiserror::Error;

/// Main error type for all amqwire operations.
#[derive(Debug, Error)]
pub enum AmqwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation on the wire (bad frame end, unknown frame type,
    /// unknown type tag, unknown class/method, malformed payload).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// API misuse or handshake failure.
    #[error("client error: {0}")]
    Client(String),

    /// The connection is closed or closing.
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel is closed or closing.
    #[error("channel closed")]
    ChannelClosed,
}

/// Result type alias using AmqwireError.
pub type Result<T> = std::result::Result<T, AmqwireError>;
