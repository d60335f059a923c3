use std::time::Duration;

use tunplex_frame::{CipherError, FrameError};
use tunplex_transport::TransportError;

use crate::wire::WireError;

/// Broad failure classes used for propagation decisions and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer sent something that violates the protocol.
    Protocol,
    /// The connection failed, closed or timed out.
    Transport,
    /// Local configuration is invalid.
    Configuration,
    /// The peer answered with a failure status.
    Rejected,
}

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Cipher chain error.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Request or Reply could not be decoded.
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),

    /// The remote refused the request. Displays as the remote's message.
    #[error("{message}")]
    Rejected { status: u8, message: String },

    /// IMUX bootstrap failed as a whole.
    #[error("imux bootstrap failed: {0}")]
    Imux(String),

    /// A bootstrap leg reused an index that was already filled.
    #[error("duplicate imux leg {index} for session {session}")]
    DuplicateLeg { session: String, index: u16 },

    /// The session or channel is gone.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The pool is at its ceiling and has nothing free.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerError::Transport(TransportError::Protocol(_)) => ErrorKind::Protocol,
            PeerError::Transport(_) => ErrorKind::Transport,
            PeerError::Frame(e) if e.is_protocol() => ErrorKind::Protocol,
            PeerError::Frame(_) => ErrorKind::Transport,
            PeerError::Cipher(CipherError::UnknownStage(_))
            | PeerError::Cipher(CipherError::NotLengthPreserving(_))
            | PeerError::Cipher(CipherError::InvalidKeyMaterial(_)) => ErrorKind::Configuration,
            PeerError::Cipher(_) | PeerError::Wire(_) | PeerError::DuplicateLeg { .. } => {
                ErrorKind::Protocol
            }
            PeerError::Rejected { .. } => ErrorKind::Rejected,
            PeerError::Imux(_)
            | PeerError::SessionClosed(_)
            | PeerError::Timeout(_)
            | PeerError::Cancelled
            | PeerError::PoolExhausted => ErrorKind::Transport,
            PeerError::Config(_) | PeerError::Json(_) => ErrorKind::Configuration,
        }
    }

    /// The innermost human-readable reason.
    pub fn reason(&self) -> String {
        match self {
            PeerError::Transport(e) => e.to_string(),
            PeerError::Frame(e) => e.to_string(),
            PeerError::Cipher(e) => e.to_string(),
            PeerError::Wire(e) => e.to_string(),
            PeerError::Imux(msg) | PeerError::SessionClosed(msg) | PeerError::Config(msg) => {
                msg.clone()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_displays_remote_message() {
        let err = PeerError::Rejected {
            status: 7,
            message: "refused".to_string(),
        };
        assert_eq!(err.to_string(), "refused");
        assert_eq!(err.kind(), ErrorKind::Rejected);
    }

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(
            PeerError::from(WireError::ChecksumFailed).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            PeerError::from(CipherError::UnknownStage("rot13".into())).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            PeerError::from(TransportError::Closed).kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            PeerError::DuplicateLeg {
                session: "s".into(),
                index: 0
            }
            .kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn reason_strips_wrapping() {
        let err = PeerError::Imux("connection refused".to_string());
        assert_eq!(err.reason(), "connection refused");
    }
}
