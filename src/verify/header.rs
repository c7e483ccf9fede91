//! Verify header codec
//!
//! Every verified sub-block starts with a fixed 12-byte base header followed
//! by an algorithm-specific payload:
//!
//! ```text
//! 0        4          8            12
//! +--------+----------+------------+---------------------------+
//! | magic  | blk_len  | algorithm  | digest or metadata ...    |
//! +--------+----------+------------+---------------------------+
//! ```
//!
//! All integers are little-endian. `blk_len` is the size of the whole
//! sub-block, header included. The metadata payload is
//! `offset:u64 | thread:u32 | sequence:u32 | time_sec:u64 | time_usec:u64`.

use crate::checksum::{Algorithm, Digest};
use thiserror::Error;

/// Sentinel at the start of every verify header
pub const HEADER_MAGIC: u32 = 0xf00b_aaef;

/// magic + block length + algorithm tag
pub const BASE_HEADER_SIZE: usize = 12;

/// Largest region [`apply_swap`] will exchange
pub const MAX_SWAP_SIZE: usize = 200;

/// Total header size for `algorithm`
pub const fn header_size(algorithm: Algorithm) -> usize {
    BASE_HEADER_SIZE + algorithm.digest_size()
}

/// Why a header failed to decode
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderFault {
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("unknown algorithm tag {0}")]
    UnknownAlgorithm(u32),

    #[error("algorithm {found} does not match expected {expected}")]
    AlgorithmMismatch { expected: Algorithm, found: Algorithm },

    #[error("block length {found} does not match expected {expected}")]
    LengthMismatch { expected: usize, found: usize },

    #[error("block of {len} bytes is too short for a {needed} byte header")]
    Truncated { len: usize, needed: usize },
}

/// Metadata payload for [`Algorithm::Meta`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaPayload {
    /// Logical file offset of the sub-block
    pub offset: u64,
    /// Writing thread/worker number
    pub thread: u32,
    /// Write sequence number at issue time
    pub sequence: u32,
    pub time_sec: u64,
    pub time_usec: u64,
}

impl MetaPayload {
    const SIZE: usize = 32;

    fn encode(&self, dst: &mut [u8]) {
        dst[0..8].copy_from_slice(&self.offset.to_le_bytes());
        dst[8..12].copy_from_slice(&self.thread.to_le_bytes());
        dst[12..16].copy_from_slice(&self.sequence.to_le_bytes());
        dst[16..24].copy_from_slice(&self.time_sec.to_le_bytes());
        dst[24..32].copy_from_slice(&self.time_usec.to_le_bytes());
    }

    fn decode(src: &[u8]) -> Self {
        Self {
            offset: read_u64(&src[0..8]),
            thread: read_u32(&src[8..12]),
            sequence: read_u32(&src[12..16]),
            time_sec: read_u64(&src[16..24]),
            time_usec: read_u64(&src[24..32]),
        }
    }
}

/// Algorithm-specific part of a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPayload {
    Empty,
    Digest(Digest),
    Meta(MetaPayload),
}

/// Decoded verify header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyHeader {
    pub algorithm: Algorithm,
    /// Size of the sub-block this header covers, header included
    pub block_len: u32,
    pub payload: HeaderPayload,
}

impl VerifyHeader {
    pub fn size(&self) -> usize {
        header_size(self.algorithm)
    }

    /// Bytes of data after the header
    pub fn data_len(&self) -> usize {
        (self.block_len as usize).saturating_sub(self.size())
    }

    /// Write the header into the first `self.size()` bytes of `dst`
    pub fn encode_into(&self, dst: &mut [u8]) -> Result<(), HeaderFault> {
        let needed = self.size();
        if dst.len() < needed {
            return Err(HeaderFault::Truncated { len: dst.len(), needed });
        }

        dst[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        dst[4..8].copy_from_slice(&self.block_len.to_le_bytes());
        dst[8..12].copy_from_slice(&self.algorithm.tag().to_le_bytes());

        let payload = &mut dst[BASE_HEADER_SIZE..needed];
        match &self.payload {
            HeaderPayload::Empty => {}
            HeaderPayload::Digest(d) => payload.copy_from_slice(d.as_bytes()),
            HeaderPayload::Meta(m) => m.encode(payload),
        }
        Ok(())
    }

    /// Decode a header from the start of `src`
    ///
    /// Only the magic, the tag and the minimum length are checked here; use
    /// [`decode_block`] to also validate the recorded block length.
    pub fn decode(src: &[u8]) -> Result<Self, HeaderFault> {
        if src.len() < BASE_HEADER_SIZE {
            return Err(HeaderFault::Truncated { len: src.len(), needed: BASE_HEADER_SIZE });
        }

        let magic = read_u32(&src[0..4]);
        if magic != HEADER_MAGIC {
            return Err(HeaderFault::BadMagic(magic));
        }

        let block_len = read_u32(&src[4..8]);
        let tag = read_u32(&src[8..12]);
        let algorithm = Algorithm::from_tag(tag).ok_or(HeaderFault::UnknownAlgorithm(tag))?;

        let needed = header_size(algorithm);
        if src.len() < needed {
            return Err(HeaderFault::Truncated { len: src.len(), needed });
        }
        if (block_len as usize) < needed {
            return Err(HeaderFault::LengthMismatch {
                expected: needed,
                found: block_len as usize,
            });
        }

        let raw = &src[BASE_HEADER_SIZE..needed];
        let payload = match algorithm {
            Algorithm::Meta => HeaderPayload::Meta(MetaPayload::decode(raw)),
            a if a.is_content_digest() => HeaderPayload::Digest(Digest::from_slice(raw)),
            _ => HeaderPayload::Empty,
        };

        Ok(Self { algorithm, block_len, payload })
    }
}

/// Decode the header of a whole sub-block and check it describes exactly
/// this block: `block_len == header_size(algorithm) + data bytes`.
pub fn decode_block(block: &[u8], expected: Algorithm) -> Result<VerifyHeader, HeaderFault> {
    let header = VerifyHeader::decode(block)?;
    if header.algorithm != expected && !crc32c_alias(header.algorithm, expected) {
        return Err(HeaderFault::AlgorithmMismatch { expected, found: header.algorithm });
    }
    if header.block_len as usize != block.len() {
        return Err(HeaderFault::LengthMismatch {
            expected: block.len(),
            found: header.block_len as usize,
        });
    }
    Ok(header)
}

// Both CRC32C tags produce identical digests, so data written with one may be
// read back expecting the other.
fn crc32c_alias(a: Algorithm, b: Algorithm) -> bool {
    matches!(
        (a, b),
        (Algorithm::Crc32c, Algorithm::Crc32cIntel) | (Algorithm::Crc32cIntel, Algorithm::Crc32c)
    )
}

/// Exchange the first `size` bytes of `block` with the `size` bytes starting
/// at `offset`.
///
/// Applying the same swap twice restores the block. The two regions must not
/// overlap and must both lie inside the block.
pub fn apply_swap(block: &mut [u8], offset: usize, size: usize) -> Result<(), HeaderFault> {
    debug_assert!(size <= MAX_SWAP_SIZE);
    let needed = offset + size;
    if offset < size || block.len() < needed {
        return Err(HeaderFault::Truncated { len: block.len(), needed });
    }
    let (head, tail) = block.split_at_mut(offset);
    head[..size].swap_with_slice(&mut tail[..size]);
    Ok(())
}

fn read_u32(b: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&b[..4]);
    u32::from_le_bytes(raw)
}

fn read_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    u64::from_le_bytes(raw)
}

const _: () = assert!(MetaPayload::SIZE == Algorithm::Meta.digest_size());
