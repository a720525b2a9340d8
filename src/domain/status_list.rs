//! Packed status list bitset.
//!
//! A [`StatusList`] stores one fixed-width status value (1, 2, 4 or 8 bits)
//! per credential. Index `i` lives in byte `i / (8 / bits)`, starting at the
//! least significant bit, which is the layout verifiers expect inside the
//! `lst` claim of a status list token.

use std::io::{Read, Write};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::ServiceError;

/// Bit widths a status list may use.
pub const ALLOWED_BITS: [u8; 4] = [1, 2, 4, 8];

/// Validates a status bit width.
///
/// # Errors
///
/// Returns [`ServiceError::InvalidRequest`] unless `bits` is 1, 2, 4 or 8.
pub fn validate_bits(bits: u8) -> Result<(), ServiceError> {
    if ALLOWED_BITS.contains(&bits) {
        Ok(())
    } else {
        Err(ServiceError::InvalidRequest(format!(
            "bits must be one of 1, 2, 4, 8 (got {bits})"
        )))
    }
}

/// Largest packed list this service decodes or configures (32 MiB, about
/// 268 million one-bit entries).
pub const MAX_LIST_BYTES: u64 = 32 * 1024 * 1024;

/// Number of bytes needed to hold `size` entries of `bits` each.
#[must_use]
pub fn byte_len(size: u64, bits: u8) -> u64 {
    size.saturating_mul(u64::from(bits)).div_ceil(8)
}

/// A bounds-checked, packed array of status values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusList {
    size: u64,
    bits: u8,
    data: Vec<u8>,
}

impl StatusList {
    /// Creates a list of `size` entries, all set to `0`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidRequest`] on an unsupported bit width
    /// or a size that does not fit into memory.
    pub fn new(size: u64, bits: u8) -> Result<Self, ServiceError> {
        validate_bits(bits)?;
        let len = usize::try_from(byte_len(size, bits))
            .map_err(|_| ServiceError::InvalidRequest(format!("list size {size} too large")))?;
        Ok(Self {
            size,
            bits,
            data: vec![0; len],
        })
    }

    /// Wraps an existing packed buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidRequest`] if the bit width is invalid
    /// or the buffer length is not `ceil(size * bits / 8)`.
    pub fn from_bytes(size: u64, bits: u8, data: Vec<u8>) -> Result<Self, ServiceError> {
        validate_bits(bits)?;
        let expected = byte_len(size, bits);
        if data.len() as u64 != expected {
            return Err(ServiceError::InvalidRequest(format!(
                "status list buffer has {} bytes, expected {expected}",
                data.len()
            )));
        }
        Ok(Self { size, bits, data })
    }

    /// Decodes the base64url form of a compressed list, as found in a
    /// token's `lst` claim. The size is derived from the buffer length.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidRequest`] on malformed base64 or
    /// compressed data, or if it inflates past [`MAX_LIST_BYTES`].
    pub fn from_encoded(bits: u8, encoded: &str) -> Result<Self, ServiceError> {
        validate_bits(bits)?;
        let data = decompress(&decode_lst(encoded)?, MAX_LIST_BYTES)?;
        let size = (data.len() as u64).saturating_mul(8) / u64::from(bits);
        Ok(Self { size, bits, data })
    }

    /// Like [`StatusList::from_encoded`] for a list of known `size`.
    /// Inflation stops at the expected byte length.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidRequest`] on malformed input or a
    /// length other than `ceil(size * bits / 8)`.
    pub fn from_encoded_sized(size: u64, bits: u8, encoded: &str) -> Result<Self, ServiceError> {
        validate_bits(bits)?;
        let limit = byte_len(size, bits).min(MAX_LIST_BYTES);
        let data = decompress(&decode_lst(encoded)?, limit)?;
        Self::from_bytes(size, bits, data)
    }

    /// Number of entries in the list.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Bit width of each entry.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.bits
    }

    /// Largest value an entry can hold.
    #[must_use]
    pub const fn max_value(&self) -> u8 {
        u8::MAX >> (8 - self.bits)
    }

    /// Reads the status at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::OutOfRange`] if `index >= size`.
    pub fn get(&self, index: u64) -> Result<u8, ServiceError> {
        let (byte, shift) = self.locate(index)?;
        let value = self.data.get(byte).copied().ok_or(ServiceError::OutOfRange {
            index,
            size: self.size,
        })?;
        Ok((value >> shift) & self.max_value())
    }

    /// Writes `value` at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::OutOfRange`] if `index >= size` and
    /// [`ServiceError::ValueOutOfRange`] if `value` needs more than `bits`.
    pub fn set(&mut self, index: u64, value: u8) -> Result<(), ServiceError> {
        let mask = self.max_value();
        if value > mask {
            return Err(ServiceError::ValueOutOfRange {
                value,
                bits: self.bits,
            });
        }
        let (byte, shift) = self.locate(index)?;
        let size = self.size;
        let slot = self
            .data
            .get_mut(byte)
            .ok_or(ServiceError::OutOfRange { index, size })?;
        *slot = (*slot & !(mask << shift)) | (value << shift);
        Ok(())
    }

    /// Returns the packed buffer.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns a copy of the packed buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.clone()
    }

    /// Consumes the list, returning its packed buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Zlib-compresses the packed buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Internal`] if the encoder fails.
    pub fn compress(&self) -> Result<Vec<u8>, ServiceError> {
        compress(&self.data)
    }

    /// Encodes the list for the `lst` claim: base64url (no padding) of the
    /// zlib-compressed buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Internal`] if compression fails.
    pub fn encode(&self) -> Result<String, ServiceError> {
        Ok(URL_SAFE_NO_PAD.encode(self.compress()?))
    }

    fn locate(&self, index: u64) -> Result<(usize, u32), ServiceError> {
        if index >= self.size {
            return Err(ServiceError::OutOfRange {
                index,
                size: self.size,
            });
        }
        let per_byte = u64::from(8 / self.bits);
        let byte = usize::try_from(index / per_byte).map_err(|_| ServiceError::OutOfRange {
            index,
            size: self.size,
        })?;
        // always < 8
        let shift = ((index % per_byte) * u64::from(self.bits)) as u32;
        Ok((byte, shift))
    }
}

/// Zlib-compresses `data` with the best compression level.
///
/// # Errors
///
/// Returns [`ServiceError::Internal`] if the encoder fails.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, ServiceError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| ServiceError::Internal(format!("compression failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| ServiceError::Internal(format!("compression failed: {e}")))
}

/// Inverse of [`compress`], producing at most `limit` bytes.
///
/// # Errors
///
/// Returns [`ServiceError::InvalidRequest`] on corrupt input or output
/// longer than `limit`.
pub fn decompress(data: &[u8], limit: u64) -> Result<Vec<u8>, ServiceError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| ServiceError::InvalidRequest(format!("invalid compressed list: {e}")))?;
    if out.len() as u64 > limit {
        return Err(ServiceError::InvalidRequest(format!(
            "compressed list inflates past {limit} bytes"
        )));
    }
    Ok(out)
}

fn decode_lst(encoded: &str) -> Result<Vec<u8>, ServiceError> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| ServiceError::InvalidRequest(format!("invalid lst encoding: {e}")))
}
