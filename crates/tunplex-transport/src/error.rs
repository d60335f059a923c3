use std::time::Duration;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote end went away in the middle of a message.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The stream delivered bytes that violate its framing rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The stream has been closed locally.
    #[error("stream closed")]
    Closed,
}

impl TransportError {
    /// True when the error means the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected(_) | TransportError::Closed | TransportError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
