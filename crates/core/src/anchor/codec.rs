use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use super::{Anchor, Bias};

type HmacSha256 = Hmac<Sha256>;

pub const ANCHOR_CODEC_VERSION: u8 = 1;
/// Maximum UTF-8 byte length for `block_id` in the compact encoding.
pub const MAX_BLOCK_ID_LEN: usize = u16::MAX as usize;
/// Truncated HMAC-SHA256 tag length.
pub const ANCHOR_TAG_LEN: usize = 16;
const ANCHOR_FIXED_BYTES: usize = 12; // version (1) + bias (1) + block_id_len (2) + offset (8)
const DEFAULT_ANCHOR_KEY: &[u8] = b"tether.anchor.v1";

/// Encodes anchors as opaque, integrity-protected tokens.
///
/// Layout before base64url:
/// - byte 0: codec version
/// - byte 1: bias (0 = before, 1 = after)
/// - bytes 2..4: block_id byte length (u16, little-endian)
/// - next `len` bytes: UTF-8 block_id
/// - next 8 bytes: offset (u64, little-endian)
/// - final 16 bytes: HMAC-SHA256 over everything above, truncated
#[derive(Clone)]
pub struct AnchorCodec {
    key: Vec<u8>,
}

impl std::fmt::Debug for AnchorCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorCodec").field("key", &"<redacted>").finish()
    }
}

impl Default for AnchorCodec {
    fn default() -> Self {
        Self { key: DEFAULT_ANCHOR_KEY.to_vec() }
    }
}

impl AnchorCodec {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self { key: key.as_ref().to_vec() }
    }

    pub fn encode(&self, anchor: &Anchor) -> Result<String, AnchorCodecError> {
        let block_bytes = anchor.block_id.as_bytes();
        if block_bytes.len() > MAX_BLOCK_ID_LEN {
            return Err(AnchorCodecError::BlockIdTooLong {
                len: block_bytes.len(),
                max: MAX_BLOCK_ID_LEN,
            });
        }

        let mut payload =
            Vec::with_capacity(ANCHOR_FIXED_BYTES + block_bytes.len() + ANCHOR_TAG_LEN);
        payload.push(ANCHOR_CODEC_VERSION);
        payload.push(anchor.bias.to_byte());
        payload.extend_from_slice(&(block_bytes.len() as u16).to_le_bytes());
        payload.extend_from_slice(block_bytes);
        payload.extend_from_slice(&(anchor.offset as u64).to_le_bytes());

        let tag = self.sign(&payload);
        payload.extend_from_slice(&tag[..ANCHOR_TAG_LEN]);
        Ok(URL_SAFE_NO_PAD.encode(payload))
    }

    /// Fails closed: any corruption, version mismatch or bad signature is `None`.
    pub fn decode(&self, token: &str) -> Option<Anchor> {
        self.try_decode(token).ok()
    }

    pub fn try_decode(&self, token: &str) -> Result<Anchor, AnchorCodecError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| AnchorCodecError::InvalidEncoding)?;

        let min_len = ANCHOR_FIXED_BYTES + ANCHOR_TAG_LEN;
        if bytes.len() < min_len {
            return Err(AnchorCodecError::PayloadTooShort { expected: min_len, actual: bytes.len() });
        }

        let (payload, tag) = bytes.split_at(bytes.len() - ANCHOR_TAG_LEN);
        let mut mac = self.mac();
        mac.update(payload);
        mac.verify_truncated_left(tag).map_err(|_| AnchorCodecError::SignatureMismatch)?;

        if payload[0] != ANCHOR_CODEC_VERSION {
            return Err(AnchorCodecError::UnsupportedVersion(payload[0]));
        }
        let bias = Bias::from_byte(payload[1]).ok_or(AnchorCodecError::InvalidBias(payload[1]))?;
        let block_len = u16::from_le_bytes([payload[2], payload[3]]) as usize;
        let expected_len = ANCHOR_FIXED_BYTES + block_len;
        if payload.len() != expected_len {
            return Err(AnchorCodecError::LengthMismatch {
                expected: expected_len,
                actual: payload.len(),
            });
        }

        let block_start = 4;
        let block_end = block_start + block_len;
        let block_id = String::from_utf8(payload[block_start..block_end].to_vec())
            .map_err(|_| AnchorCodecError::InvalidUtf8BlockId)?;

        let mut offset_bytes = [0u8; 8];
        offset_bytes.copy_from_slice(&payload[block_end..block_end + 8]);
        let offset = usize::try_from(u64::from_le_bytes(offset_bytes))
            .map_err(|_| AnchorCodecError::OffsetOverflow)?;

        Ok(Anchor { block_id, offset, bias })
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length, including empty.
        match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac accepts keys of any length"),
        }
    }
}

/// Encode with the built-in key.
pub fn encode_anchor(anchor: &Anchor) -> Result<String, AnchorCodecError> {
    AnchorCodec::default().encode(anchor)
}

/// Decode with the built-in key; `None` on any failure.
pub fn decode_anchor(token: &str) -> Option<Anchor> {
    AnchorCodec::default().decode(token)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnchorCodecError {
    #[error("block_id exceeds maximum length ({max} bytes), got {len}")]
    BlockIdTooLong { len: usize, max: usize },
    #[error("anchor token is not valid base64url")]
    InvalidEncoding,
    #[error("anchor payload too short: expected at least {expected} bytes, got {actual}")]
    PayloadTooShort { expected: usize, actual: usize },
    #[error("anchor payload length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("anchor signature does not match")]
    SignatureMismatch,
    #[error("unsupported anchor codec version: {0}")]
    UnsupportedVersion(u8),
    #[error("invalid bias marker: {0}")]
    InvalidBias(u8),
    #[error("block_id is not valid UTF-8")]
    InvalidUtf8BlockId,
    #[error("anchor offset does not fit in usize")]
    OffsetOverflow,
}
