use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::cipher::{random_salt, CipherConfig, StreamTransform, SALT_LEN};
use crate::error::{FrameError, Result};

/// Frame header: length (3) + flags (1) = 4 bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest length a 24-bit header can carry.
pub const MAX_FRAME_LEN: usize = 0x00FF_FFFF;

/// Default maximum payload size: the full 24-bit range.
pub const DEFAULT_MAX_PAYLOAD: usize = MAX_FRAME_LEN;

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Values above [`MAX_FRAME_LEN`] are clamped.
    pub max_payload_size: usize,
    /// Connection-level cipher chain. Must be length-preserving.
    pub cipher: CipherConfig,
}

impl FrameConfig {
    pub fn with_cipher(mut self, cipher: CipherConfig) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_max_payload(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    fn effective_max(&self) -> usize {
        self.max_payload_size.min(MAX_FRAME_LEN)
    }

    /// Check the cipher chain can run on a byte stream.
    pub fn validate(&self) -> Result<()> {
        if !self.cipher.spec().is_length_preserving() {
            self.cipher.stream_transform(&[0u8; SALT_LEN])?;
        }
        Ok(())
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            cipher: CipherConfig::plain(),
        }
    }
}

/// Encode one frame into the wire format.
///
/// Wire format (before encryption):
/// ```text
/// ┌────────────────┬───────────┬────────────────────┐
/// │ Length (3B BE) │ Flags (1B)│ Payload            │
/// │                │ 0x00      │ (Length bytes)     │
/// └────────────────┴───────────┴────────────────────┘
/// ```
///
/// The header and then the payload pass through `transform`, so both ends
/// must feed their keystreams in exactly this order.
pub fn encode_frame(
    payload: &[u8],
    max_payload: usize,
    transform: &mut StreamTransform,
    dst: &mut BytesMut,
) -> Result<()> {
    let max = max_payload.min(MAX_FRAME_LEN);
    if payload.len() > max {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max,
        });
    }

    let len = payload.len() as u32;
    let mut header = [(len >> 16) as u8, (len >> 8) as u8, len as u8, 0];
    transform.apply(&mut header);

    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&header);
    let start = dst.len();
    dst.put_slice(payload);
    transform.apply(&mut dst[start..]);
    Ok(())
}

/// Parse a decrypted header, returning the payload length.
pub fn parse_header(header: [u8; HEADER_SIZE], max_payload: usize) -> Result<usize> {
    if header[3] != 0 {
        return Err(FrameError::ReservedFlags(header[3]));
    }
    let len = ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
    let max = max_payload.min(MAX_FRAME_LEN);
    if len > max {
        return Err(FrameError::PayloadTooLarge { size: len, max });
    }
    Ok(len)
}

/// Decode one frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// The header is decrypted as soon as it arrives and its length parked in
/// `pending`, so the keystream is consumed exactly once per byte.
pub fn decode_frame(
    src: &mut BytesMut,
    pending: &mut Option<usize>,
    max_payload: usize,
    transform: &mut StreamTransform,
) -> Result<Option<Bytes>> {
    let len = match *pending {
        Some(len) => len,
        None => {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }
            let mut header = [0u8; HEADER_SIZE];
            header.copy_from_slice(&src[..HEADER_SIZE]);
            transform.apply(&mut header);
            src.advance(HEADER_SIZE);
            let len = parse_header(header, max_payload)?;
            *pending = Some(len);
            len
        }
    };

    if src.len() < len {
        src.reserve(len - src.len());
        return Ok(None);
    }

    *pending = None;
    let mut payload = src.split_to(len);
    transform.apply(&mut payload);
    Ok(Some(payload.freeze()))
}

/// Outbound half of the frame codec.
///
/// With a non-empty cipher chain the first bytes written are a random
/// plaintext salt that keys this direction.
#[derive(Debug)]
pub struct FrameEncoder {
    config: FrameConfig,
    transform: Option<StreamTransform>,
}

impl FrameEncoder {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            transform: None,
        }
    }

    fn begin(&self, dst: &mut BytesMut) -> Result<StreamTransform> {
        if self.config.cipher.is_plain() {
            return Ok(StreamTransform::identity());
        }
        let salt = random_salt();
        dst.put_slice(&salt);
        trace!(cipher = %self.config.cipher.spec(), "sent stream salt");
        Ok(self.config.cipher.stream_transform(&salt)?)
    }
}

impl Encoder<Bytes> for FrameEncoder {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        let max = self.config.effective_max();
        if item.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: item.len(),
                max,
            });
        }
        let transform = match self.transform.take() {
            Some(transform) => transform,
            None => self.begin(dst)?,
        };
        let transform = self.transform.insert(transform);
        encode_frame(&item, max, transform, dst)
    }
}

/// Inbound half of the frame codec.
#[derive(Debug)]
pub struct FrameDecoder {
    config: FrameConfig,
    transform: Option<StreamTransform>,
    pending: Option<usize>,
}

impl FrameDecoder {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            transform: None,
            pending: None,
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let transform = match self.transform.take() {
            Some(transform) => transform,
            None if self.config.cipher.is_plain() => StreamTransform::identity(),
            None => {
                if src.len() < SALT_LEN {
                    return Ok(None);
                }
                let salt = src.split_to(SALT_LEN);
                trace!(cipher = %self.config.cipher.spec(), "received stream salt");
                self.config.cipher.stream_transform(&salt)?
            }
        };
        let transform = self.transform.insert(transform);
        decode_frame(
            src,
            &mut self.pending,
            self.config.effective_max(),
            transform,
        )
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.pending.is_none() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherSpec, CipherConfig};

    fn aes_config() -> FrameConfig {
        FrameConfig::default().with_cipher(CipherConfig::new(CipherSpec::default_stream(), "pw").unwrap())
    }

    fn roundtrip(config: FrameConfig, payloads: &[&[u8]]) -> Vec<Bytes> {
        let mut enc = FrameEncoder::new(config.clone());
        let mut dec = FrameDecoder::new(config);
        let mut wire = BytesMut::new();
        for p in payloads {
            enc.encode(Bytes::copy_from_slice(p), &mut wire).unwrap();
        }
        let mut out = Vec::new();
        while let Some(frame) = dec.decode(&mut wire).unwrap() {
            out.push(frame);
        }
        assert!(wire.is_empty());
        out
    }

    #[test]
    fn test_plain_header_layout() {
        let mut wire = BytesMut::new();
        encode_frame(b"hello", MAX_FRAME_LEN, &mut StreamTransform::identity(), &mut wire).unwrap();
        assert_eq!(&wire[..HEADER_SIZE], &[0, 0, 5, 0]);
        assert_eq!(&wire[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_length_invariant_at_boundaries() {
        for len in [0usize, 1, 4096, MAX_FRAME_LEN] {
            let payload = vec![0x5Au8; len];
            let frames = roundtrip(FrameConfig::default(), &[&payload]);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].len(), len);
        }
    }

    #[test]
    fn test_oversized_payload_rejected_at_encode() {
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        let mut wire = BytesMut::new();
        let err = encode_frame(&payload, usize::MAX, &mut StreamTransform::identity(), &mut wire)
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge { size: 0x100_0000, max: MAX_FRAME_LEN }
        ));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_configured_max_applies_both_ways() {
        let config = FrameConfig::default().with_max_payload(8);
        let mut enc = FrameEncoder::new(config.clone());
        let mut wire = BytesMut::new();
        let err = enc.encode(Bytes::from_static(b"too long!"), &mut wire).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 9, max: 8 }));

        let mut wire = BytesMut::from(&[0u8, 0, 9, 0][..]);
        let mut dec = FrameDecoder::new(config);
        assert!(matches!(
            dec.decode(&mut wire),
            Err(FrameError::PayloadTooLarge { size: 9, max: 8 })
        ));
    }

    #[test]
    fn test_reserved_flags_rejected() {
        let mut wire = BytesMut::from(&[0u8, 0, 1, 0x80, 0xAA][..]);
        let mut dec = FrameDecoder::new(FrameConfig::default());
        assert!(matches!(
            dec.decode(&mut wire),
            Err(FrameError::ReservedFlags(0x80))
        ));
    }

    #[test]
    fn test_encrypted_roundtrip_multiple_frames() {
        let frames = roundtrip(aes_config(), &[b"first", b"", b"third frame"]);
        let got: Vec<&[u8]> = frames.iter().map(|f| f.as_ref()).collect();
        assert_eq!(got, vec![&b"first"[..], b"", b"third frame"]);
    }

    #[test]
    fn test_encrypted_wire_starts_with_salt_and_hides_header() {
        let mut enc = FrameEncoder::new(aes_config());
        let mut wire = BytesMut::new();
        enc.encode(Bytes::from_static(b"secret"), &mut wire).unwrap();

        assert_eq!(wire.len(), SALT_LEN + HEADER_SIZE + 6);
        assert_ne!(&wire[SALT_LEN..SALT_LEN + HEADER_SIZE], &[0, 0, 6, 0]);
        assert!(!wire.windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn test_two_encoders_pick_different_salts() {
        let mut a = BytesMut::new();
        let mut b = BytesMut::new();
        FrameEncoder::new(aes_config())
            .encode(Bytes::from_static(b"x"), &mut a)
            .unwrap();
        FrameEncoder::new(aes_config())
            .encode(Bytes::from_static(b"x"), &mut b)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_partial_input_decodes_once_complete() {
        let mut enc = FrameEncoder::new(aes_config());
        let mut full = BytesMut::new();
        enc.encode(Bytes::from_static(b"dribble"), &mut full).unwrap();

        let mut dec = FrameDecoder::new(aes_config());
        let mut buf = BytesMut::new();
        let mut got = None;
        for byte in full.iter() {
            buf.put_u8(*byte);
            if let Some(frame) = dec.decode(&mut buf).unwrap() {
                got = Some(frame);
            }
        }
        assert_eq!(got.unwrap().as_ref(), b"dribble");
    }

    #[test]
    fn test_eof_mid_frame_is_disconnect() {
        let mut wire = BytesMut::new();
        encode_frame(b"hello", MAX_FRAME_LEN, &mut StreamTransform::identity(), &mut wire).unwrap();
        wire.truncate(HEADER_SIZE + 2);

        let mut dec = FrameDecoder::new(FrameConfig::default());
        assert!(dec.decode(&mut wire).unwrap().is_none());
        assert!(matches!(
            dec.decode_eof(&mut wire),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_eof_between_frames_is_clean() {
        let mut wire = BytesMut::new();
        let mut dec = FrameDecoder::new(FrameConfig::default());
        assert!(dec.decode_eof(&mut wire).unwrap().is_none());
    }

    #[test]
    fn test_message_stage_rejected_for_stream() {
        let spec = CipherSpec::parse(&["aes", "crc32c"]).unwrap();
        let config = FrameConfig::default().with_cipher(CipherConfig::new(spec, "pw").unwrap());
        assert!(matches!(
            config.validate(),
            Err(FrameError::Cipher(crate::error::CipherError::NotLengthPreserving(_)))
        ));
    }
}
