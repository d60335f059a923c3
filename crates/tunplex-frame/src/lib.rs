//! Encrypted length-delimited framing for tunplex.
//!
//! Every frame on the wire is:
//! - A 3-byte big-endian payload length
//! - A reserved flags byte (always zero)
//! - The payload
//!
//! Header and payload run through one keystream per direction, keyed by a
//! random salt sent in clear at the start of the stream. The same cipher
//! chain logic also seals individual channels via [`SealedStream`].

pub mod cipher;
pub mod codec;
pub mod error;
pub mod reader;
pub mod sealed;
mod speck;
pub mod stream;
pub mod writer;

pub use cipher::{
    derive_key, CipherConfig, CipherSpec, MessageTransform, StageKind, StreamTransform, KEY_LEN,
    SALT_LEN,
};
pub use codec::{
    decode_frame, encode_frame, FrameConfig, FrameDecoder, FrameEncoder, DEFAULT_MAX_PAYLOAD,
    HEADER_SIZE, MAX_FRAME_LEN,
};
pub use error::{CipherError, FrameError, Result};
pub use reader::FrameReader;
pub use sealed::SealedStream;
pub use stream::FramedStream;
pub use writer::FrameWriter;
