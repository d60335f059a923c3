use tunplex_transport::TransportError;

/// Errors raised while building or running a cipher chain.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// A configured stage name is not recognised.
    #[error("unknown cipher stage: {0}")]
    UnknownStage(String),

    /// A stage that changes message length was used on a byte stream.
    #[error("cipher stage {0} is not length-preserving and cannot run on a byte stream")]
    NotLengthPreserving(&'static str),

    /// The derived key or IV was rejected by a primitive.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// The salt announced by the peer has the wrong size.
    #[error("invalid salt length {0}")]
    SaltLength(usize),

    /// The checksum trailer does not match the message.
    #[error("checksum failed at message {seq}")]
    ChecksumMismatch { seq: u64 },

    /// A message is too short to carry the expected trailer or prefix.
    #[error("message truncated (needed {needed} bytes, got {got})")]
    Truncated { needed: usize, got: usize },

    /// Decompression failed or exceeded the size limit.
    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The reserved flags byte was not zero.
    #[error("reserved frame flags set: {0:#04x}")]
    ReservedFlags(u8),

    /// The cipher chain failed.
    #[error(transparent)]
    Cipher(#[from] CipherError),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True when the error means the stream violated the frame format.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            FrameError::PayloadTooLarge { .. } | FrameError::ReservedFlags(_) | FrameError::Cipher(_)
        )
    }
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io) => TransportError::Io(io),
            FrameError::ConnectionClosed => {
                TransportError::Disconnected("connection closed mid-frame".to_string())
            }
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
