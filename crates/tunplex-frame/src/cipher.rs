//! Composable cipher chains.
//!
//! A chain is an ordered list of stages parsed from names such as
//! `aes,crc32c`. Keystream stages (AES-OFB, ChaCha20, Speck-CTR) are
//! length-preserving and may run on a byte stream; the checksum and LZ4
//! stages work on whole messages only.
//!
//! The CRC32C stage catches reordering, truncation and corruption. It is not
//! a MAC: anyone who can rewrite ciphertext can rewrite the checksum too.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::warn;

use crate::error::CipherError;
use crate::speck::{Speck128Ctr, Speck256Ctr};

/// Length of the per-direction random salt.
pub const SALT_LEN: usize = 16;

/// Length of the master key derived from a passphrase.
pub const KEY_LEN: usize = 32;

/// HKDF salt for turning a passphrase into the master key.
const MASTER_KEY_SALT: &[u8] = b"tunplex master key";

const STAGE_KEY_LEN: usize = 32;
const STAGE_IV_LEN: usize = 16;

const CHECKSUM_LEN: usize = 4;
const LZ4_SIZE_PREFIX: usize = 4;

type Aes256Ofb = ofb::Ofb<aes::Aes256>;

pub type Result<T> = std::result::Result<T, CipherError>;

/// One configurable stage of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// AES-256 in OFB mode.
    AesOfb,
    /// ChaCha20 with a 96-bit IETF nonce.
    ChaCha20,
    /// Speck128/128 in counter mode.
    Speck128,
    /// Speck128/256 in counter mode.
    Speck256,
    /// CRC32C trailer over message, sequence number and length.
    Crc32c,
    /// LZ4 block compression with a size prefix.
    Lz4,
}

impl StageKind {
    /// Canonical stage name.
    pub fn name(self) -> &'static str {
        match self {
            StageKind::AesOfb => "aes",
            StageKind::ChaCha20 => "chacha20",
            StageKind::Speck128 => "speck128",
            StageKind::Speck256 => "speck256",
            StageKind::Crc32c => "crc32c",
            StageKind::Lz4 => "lz4",
        }
    }

    /// True for pure keystream stages that never change the data length.
    pub fn is_length_preserving(self) -> bool {
        !matches!(self, StageKind::Crc32c | StageKind::Lz4)
    }
}

impl FromStr for StageKind {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes" | "aes-ofb" | "aes-256-ofb" => Ok(StageKind::AesOfb),
            "chacha20" | "chacha20-ietf" => Ok(StageKind::ChaCha20),
            "speck" | "speck128" => Ok(StageKind::Speck128),
            "speck256" => Ok(StageKind::Speck256),
            "crc32c" | "checksum" => Ok(StageKind::Crc32c),
            "lz4" => Ok(StageKind::Lz4),
            other => Err(CipherError::UnknownStage(other.to_string())),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An ordered list of stages, applied first-to-last on send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipherSpec {
    stages: Vec<StageKind>,
}

impl CipherSpec {
    /// Parse a list of stage names.
    ///
    /// Unknown names fail here, at configuration time.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let stages = names
            .iter()
            .map(|name| name.as_ref())
            .filter(|name| !name.trim().is_empty())
            .map(StageKind::from_str)
            .collect::<Result<Vec<_>>>()?;

        if let Some(pos) = stages.iter().position(|s| *s == StageKind::Crc32c) {
            if pos + 1 != stages.len() {
                warn!(
                    chain = %CipherSpec { stages: stages.clone() },
                    "checksum stage is not outermost; it will not cover later stages"
                );
            }
        }

        Ok(Self { stages })
    }

    /// A chain with no stages.
    pub fn plain() -> Self {
        Self::default()
    }

    /// The default connection-level chain: AES-256-OFB.
    pub fn default_stream() -> Self {
        Self {
            stages: vec![StageKind::AesOfb],
        }
    }

    pub fn stages(&self) -> &[StageKind] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// True if every stage may run over a raw byte stream.
    pub fn is_length_preserving(&self) -> bool {
        self.stages.iter().all(|s| s.is_length_preserving())
    }

    /// Build a byte-stream transform. Rejects message-only stages.
    pub fn stream_transform(&self, key: &[u8], salt: &[u8]) -> Result<StreamTransform> {
        if let Some(stage) = self.stages.iter().find(|s| !s.is_length_preserving()) {
            return Err(CipherError::NotLengthPreserving(stage.name()));
        }
        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, kind)| KeystreamStage::new(*kind, key, salt, index))
            .collect::<Result<Vec<_>>>()?;
        Ok(StreamTransform { stages })
    }

    /// Build a whole-message transform; every stage kind is allowed.
    pub fn message_transform(&self, key: &[u8], salt: &[u8]) -> Result<MessageTransform> {
        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, kind)| match kind {
                StageKind::Crc32c => Ok(MessageStage::Checksum { seq: 0 }),
                StageKind::Lz4 => Ok(MessageStage::Lz4),
                other => KeystreamStage::new(*other, key, salt, index).map(MessageStage::Keystream),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(MessageTransform {
            stages,
            max_message: DEFAULT_MAX_MESSAGE,
        })
    }
}

impl FromStr for CipherSpec {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self> {
        let names: Vec<&str> = s.split(',').collect();
        Self::parse(&names)
    }
}

impl fmt::Display for CipherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.write_str(&names.join(","))
    }
}

/// A cipher chain bound to a master key.
#[derive(Clone)]
pub struct CipherConfig {
    spec: CipherSpec,
    key: Arc<[u8]>,
}

impl CipherConfig {
    /// Derive the master key from `passphrase` and bind it to `spec`.
    pub fn new(spec: CipherSpec, passphrase: &str) -> Result<Self> {
        Ok(Self {
            spec,
            key: derive_key(passphrase.as_bytes(), KEY_LEN)?.into(),
        })
    }

    /// No encryption at all.
    pub fn plain() -> Self {
        Self {
            spec: CipherSpec::plain(),
            key: Arc::from(Vec::new()),
        }
    }

    pub fn spec(&self) -> &CipherSpec {
        &self.spec
    }

    pub fn is_plain(&self) -> bool {
        self.spec.is_empty()
    }

    pub fn stream_transform(&self, salt: &[u8]) -> Result<StreamTransform> {
        check_salt(salt)?;
        self.spec.stream_transform(&self.key, salt)
    }

    pub fn message_transform(&self, salt: &[u8]) -> Result<MessageTransform> {
        check_salt(salt)?;
        self.spec.message_transform(&self.key, salt)
    }
}

impl fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherConfig")
            .field("spec", &self.spec.to_string())
            .field("key", &format_args!("<redacted:{} bytes>", self.key.len()))
            .finish()
    }
}

fn check_salt(salt: &[u8]) -> Result<()> {
    if salt.len() != SALT_LEN {
        return Err(CipherError::SaltLength(salt.len()));
    }
    Ok(())
}

/// Generate a fresh random salt.
pub fn random_salt() -> [u8; SALT_LEN] {
    rand::random()
}

/// Derive `len` bytes of key material from a passphrase with HKDF-SHA256.
///
/// Shorter outputs are prefixes of longer ones. At most 8160 bytes.
pub fn derive_key(passphrase: &[u8], len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    Hkdf::<Sha256>::new(Some(MASTER_KEY_SALT), passphrase)
        .expand(b"", &mut out)
        .map_err(|_| CipherError::InvalidKeyMaterial(format!("cannot derive {len} key bytes")))?;
    Ok(out)
}

/// Key and IV for one stage: HKDF keyed by the salt, with the stage index and
/// name as `info`.
fn stage_material(
    key: &[u8],
    salt: &[u8],
    index: usize,
    kind: StageKind,
) -> Result<([u8; STAGE_KEY_LEN], [u8; STAGE_IV_LEN])> {
    let index = u8::try_from(index)
        .map_err(|_| CipherError::InvalidKeyMaterial(format!("stage index {index} too large")))?;
    let mut okm = [0u8; STAGE_KEY_LEN + STAGE_IV_LEN];
    Hkdf::<Sha256>::new(Some(salt), key)
        .expand_multi_info(&[&[index][..], kind.name().as_bytes()], &mut okm)
        .map_err(|e| CipherError::InvalidKeyMaterial(e.to_string()))?;

    let mut stage_key = [0u8; STAGE_KEY_LEN];
    let mut iv = [0u8; STAGE_IV_LEN];
    stage_key.copy_from_slice(&okm[..STAGE_KEY_LEN]);
    iv.copy_from_slice(&okm[STAGE_KEY_LEN..]);
    Ok((stage_key, iv))
}

enum KeystreamStage {
    AesOfb(Box<Aes256Ofb>),
    ChaCha20(Box<chacha20::ChaCha20>),
    Speck128(Box<Speck128Ctr>),
    Speck256(Box<Speck256Ctr>),
}

impl KeystreamStage {
    fn new(kind: StageKind, key: &[u8], salt: &[u8], index: usize) -> Result<Self> {
        let (stage_key, iv) = stage_material(key, salt, index, kind)?;
        match kind {
            StageKind::AesOfb => Aes256Ofb::new_from_slices(&stage_key, &iv)
                .map(|c| KeystreamStage::AesOfb(Box::new(c)))
                .map_err(|e| CipherError::InvalidKeyMaterial(e.to_string())),
            StageKind::ChaCha20 => chacha20::ChaCha20::new_from_slices(&stage_key, &iv[..12])
                .map(|c| KeystreamStage::ChaCha20(Box::new(c)))
                .map_err(|e| CipherError::InvalidKeyMaterial(e.to_string())),
            StageKind::Speck128 => Speck128Ctr::new_from_slices(&stage_key[..16], &iv)
                .map(|c| KeystreamStage::Speck128(Box::new(c)))
                .map_err(|e| CipherError::InvalidKeyMaterial(e.to_string())),
            StageKind::Speck256 => Speck256Ctr::new_from_slices(&stage_key, &iv)
                .map(|c| KeystreamStage::Speck256(Box::new(c)))
                .map_err(|e| CipherError::InvalidKeyMaterial(e.to_string())),
            StageKind::Crc32c | StageKind::Lz4 => {
                Err(CipherError::NotLengthPreserving(kind.name()))
            }
        }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            KeystreamStage::AesOfb(c) => c.apply_keystream(buf),
            KeystreamStage::ChaCha20(c) => c.apply_keystream(buf),
            KeystreamStage::Speck128(c) => c.apply_keystream(buf),
            KeystreamStage::Speck256(c) => c.apply_keystream(buf),
        }
    }
}

/// Running keystream state for one direction of a byte stream.
pub struct StreamTransform {
    stages: Vec<KeystreamStage>,
}

impl StreamTransform {
    /// A transform that leaves data untouched.
    pub fn identity() -> Self {
        Self { stages: Vec::new() }
    }

    /// Encrypt or decrypt `buf` in place, advancing the keystream.
    pub fn apply(&mut self, buf: &mut [u8]) {
        for stage in &mut self.stages {
            stage.apply(buf);
        }
    }
}

impl fmt::Debug for StreamTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransform")
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// Default ceiling for a decompressed message.
pub const DEFAULT_MAX_MESSAGE: usize = 0x00FF_FFFF;

enum MessageStage {
    Keystream(KeystreamStage),
    Checksum { seq: u64 },
    Lz4,
}

/// Whole-message transform for one direction.
///
/// A sealing instance and the peer's opening instance must see the same
/// messages in the same order: the keystream position and the checksum
/// sequence number both advance per message.
pub struct MessageTransform {
    stages: Vec<MessageStage>,
    max_message: usize,
}

impl MessageTransform {
    /// Cap the size a compressed message may claim to expand to.
    pub fn with_max_message(mut self, max_message: usize) -> Self {
        self.max_message = max_message;
        self
    }

    /// Apply every stage in order.
    pub fn seal(&mut self, msg: &[u8]) -> Result<Bytes> {
        let mut buf = BytesMut::from(msg);
        for stage in &mut self.stages {
            match stage {
                MessageStage::Keystream(ks) => ks.apply(&mut buf),
                MessageStage::Checksum { seq } => {
                    let crc = checksum(&buf, *seq);
                    buf.put_u32(crc);
                    *seq = seq.wrapping_add(1);
                }
                MessageStage::Lz4 => {
                    buf = BytesMut::from(&lz4_flex::block::compress_prepend_size(&buf)[..]);
                }
            }
        }
        Ok(buf.freeze())
    }

    /// Strip every stage in reverse order.
    pub fn open(&mut self, msg: &[u8]) -> Result<Bytes> {
        let mut buf = BytesMut::from(msg);
        for stage in self.stages.iter_mut().rev() {
            match stage {
                MessageStage::Keystream(ks) => ks.apply(&mut buf),
                MessageStage::Checksum { seq } => {
                    if buf.len() < CHECKSUM_LEN {
                        return Err(CipherError::Truncated {
                            needed: CHECKSUM_LEN,
                            got: buf.len(),
                        });
                    }
                    let body_len = buf.len() - CHECKSUM_LEN;
                    let mut trailer = [0u8; CHECKSUM_LEN];
                    trailer.copy_from_slice(&buf[body_len..]);
                    buf.truncate(body_len);
                    if u32::from_be_bytes(trailer) != checksum(&buf, *seq) {
                        return Err(CipherError::ChecksumMismatch { seq: *seq });
                    }
                    *seq = seq.wrapping_add(1);
                }
                MessageStage::Lz4 => {
                    if buf.len() < LZ4_SIZE_PREFIX {
                        return Err(CipherError::Truncated {
                            needed: LZ4_SIZE_PREFIX,
                            got: buf.len(),
                        });
                    }
                    let claimed = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                    if claimed > self.max_message {
                        return Err(CipherError::Decompress(format!(
                            "claimed size {claimed} exceeds {}",
                            self.max_message
                        )));
                    }
                    let out = lz4_flex::block::decompress_size_prepended(&buf)
                        .map_err(|e| CipherError::Decompress(e.to_string()))?;
                    buf = BytesMut::from(&out[..]);
                }
            }
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for MessageTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTransform")
            .field("stages", &self.stages.len())
            .field("max_message", &self.max_message)
            .finish()
    }
}

fn checksum(data: &[u8], seq: u64) -> u32 {
    let crc = crc32c::crc32c(data);
    let crc = crc32c::crc32c_append(crc, &seq.to_le_bytes());
    crc32c::crc32c_append(crc, &(data.len() as u32).to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: [u8; SALT_LEN] = [3u8; SALT_LEN];

    fn key() -> Vec<u8> {
        derive_key(b"correct horse", KEY_LEN).unwrap()
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let err = CipherSpec::parse(&["aes", "rot13"]).unwrap_err();
        assert!(matches!(err, CipherError::UnknownStage(name) if name == "rot13"));
    }

    #[test]
    fn parse_accepts_aliases_and_skips_blanks() {
        let spec: CipherSpec = "aes-ofb, chacha20-ietf,,speck,checksum".parse().unwrap();
        assert_eq!(
            spec.stages(),
            &[
                StageKind::AesOfb,
                StageKind::ChaCha20,
                StageKind::Speck128,
                StageKind::Crc32c
            ]
        );
        assert_eq!(spec.to_string(), "aes,chacha20,speck128,crc32c");
    }

    #[test]
    fn derive_key_is_deterministic_and_sized() {
        let a = derive_key(b"pass", 48).unwrap();
        let b = derive_key(b"pass", 48).unwrap();
        assert_eq!(a.len(), 48);
        assert_eq!(a, b);
        assert_ne!(a, derive_key(b"other", 48).unwrap());
        assert_eq!(&derive_key(b"pass", 16).unwrap()[..], &a[..16]);
    }

    #[test]
    fn derive_key_matches_hkdf_sha256() {
        let mut expected = [0u8; KEY_LEN];
        Hkdf::<Sha256>::new(Some(MASTER_KEY_SALT), b"pass")
            .expand(b"", &mut expected)
            .unwrap();
        assert_eq!(derive_key(b"pass", KEY_LEN).unwrap(), expected);
    }

    #[test]
    fn derive_key_rejects_oversized_output() {
        assert!(matches!(
            derive_key(b"pass", 255 * 32 + 1),
            Err(CipherError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn stage_material_is_hkdf_over_salt_index_and_name() {
        let (stage_key, iv) = stage_material(&key(), &SALT, 1, StageKind::ChaCha20).unwrap();

        let mut okm = [0u8; 48];
        Hkdf::<Sha256>::new(Some(&SALT[..]), &key())
            .expand(b"\x01chacha20", &mut okm)
            .unwrap();
        assert_eq!(stage_key[..], okm[..32]);
        assert_eq!(iv[..], okm[32..]);
    }

    #[test]
    fn stage_material_separates_index_and_kind() {
        let base = stage_material(&key(), &SALT, 0, StageKind::AesOfb).unwrap();
        assert_ne!(base, stage_material(&key(), &SALT, 1, StageKind::AesOfb).unwrap());
        assert_ne!(base, stage_material(&key(), &SALT, 0, StageKind::ChaCha20).unwrap());
        assert_ne!(base, stage_material(&key(), &[4u8; SALT_LEN], 0, StageKind::AesOfb).unwrap());
    }

    #[test]
    fn stream_transform_rejects_message_stages() {
        let spec = CipherSpec::parse(&["aes", "lz4"]).unwrap();
        let err = spec.stream_transform(&key(), &SALT).unwrap_err();
        assert!(matches!(err, CipherError::NotLengthPreserving("lz4")));
    }

    #[test]
    fn stream_transform_is_symmetric_for_every_keystream() {
        for name in ["aes", "chacha20", "speck128", "speck256"] {
            let spec = CipherSpec::parse(&[name]).unwrap();
            let mut enc = spec.stream_transform(&key(), &SALT).unwrap();
            let mut dec = spec.stream_transform(&key(), &SALT).unwrap();

            let plain = b"the quick brown fox jumps over the lazy dog".to_vec();
            let mut data = plain.clone();
            enc.apply(&mut data[..7]);
            enc.apply(&mut data[7..]);
            assert_ne!(data, plain, "{name} left data unchanged");
            dec.apply(&mut data);
            assert_eq!(data, plain, "{name} did not round-trip");
        }
    }

    #[test]
    fn different_salts_give_different_keystreams() {
        let spec = CipherSpec::default_stream();
        let mut a = spec.stream_transform(&key(), &[1u8; SALT_LEN]).unwrap();
        let mut b = spec.stream_transform(&key(), &[2u8; SALT_LEN]).unwrap();
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        a.apply(&mut x);
        b.apply(&mut y);
        assert_ne!(x, y);
    }

    #[test]
    fn message_chain_roundtrip_with_compression_and_checksum() {
        let spec = CipherSpec::parse(&["lz4", "chacha20", "crc32c"]).unwrap();
        let mut sealer = spec.message_transform(&key(), &SALT).unwrap();
        let mut opener = spec.message_transform(&key(), &SALT).unwrap();

        for msg in [&b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"[..], b"", b"short"] {
            let sealed = sealer.seal(msg).unwrap();
            assert_eq!(opener.open(&sealed).unwrap().as_ref(), msg);
        }
    }

    #[test]
    fn checksum_position_changes_wire_bytes() {
        let first = CipherSpec::parse(&["crc32c", "lz4"]).unwrap();
        let last = CipherSpec::parse(&["lz4", "crc32c"]).unwrap();
        let msg = b"hello hello hello hello hello hello";

        let a = first.message_transform(&key(), &SALT).unwrap().seal(msg).unwrap();
        let b = last.message_transform(&key(), &SALT).unwrap().seal(msg).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn checksum_detects_tampering() {
        let spec = CipherSpec::parse(&["aes", "crc32c"]).unwrap();
        let mut sealer = spec.message_transform(&key(), &SALT).unwrap();
        let mut opener = spec.message_transform(&key(), &SALT).unwrap();

        let mut sealed = sealer.seal(b"payload").unwrap().to_vec();
        sealed[2] ^= 0x40;
        assert!(matches!(
            opener.open(&sealed),
            Err(CipherError::ChecksumMismatch { seq: 0 })
        ));
    }

    #[test]
    fn checksum_detects_reordering() {
        let spec = CipherSpec::parse(&["crc32c"]).unwrap();
        let mut sealer = spec.message_transform(&key(), &SALT).unwrap();
        let mut opener = spec.message_transform(&key(), &SALT).unwrap();

        let _first = sealer.seal(b"first").unwrap();
        let second = sealer.seal(b"second").unwrap();
        assert!(matches!(
            opener.open(&second),
            Err(CipherError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn checksum_detects_truncation() {
        let spec = CipherSpec::parse(&["crc32c"]).unwrap();
        let mut opener = spec.message_transform(&key(), &SALT).unwrap();
        assert!(matches!(
            opener.open(&[1, 2]),
            Err(CipherError::Truncated { needed: 4, got: 2 })
        ));
    }

    #[test]
    fn lz4_rejects_oversized_claims() {
        let spec = CipherSpec::parse(&["lz4"]).unwrap();
        let mut opener = spec
            .message_transform(&key(), &SALT)
            .unwrap()
            .with_max_message(8);
        let bomb = lz4_flex::block::compress_prepend_size(&[0u8; 64]);
        assert!(matches!(opener.open(&bomb), Err(CipherError::Decompress(_))));
    }

    #[test]
    fn config_debug_redacts_key() {
        let cfg = CipherConfig::new(CipherSpec::default_stream(), "secret-pass").unwrap();
        let dbg = format!("{cfg:?}");
        assert!(dbg.contains("<redacted:32 bytes>"));
        assert!(!dbg.contains("secret-pass"));
    }

    #[test]
    fn config_rejects_bad_salt_length() {
        let cfg = CipherConfig::new(CipherSpec::default_stream(), "k").unwrap();
        assert!(matches!(
            cfg.stream_transform(&[0u8; 3]),
            Err(CipherError::SaltLength(3))
        ));
    }
}
