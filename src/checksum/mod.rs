//! Checksum algorithms for block verification
//!
//! This module defines the closed set of verification algorithms that can be
//! recorded in a verify header, together with their fixed digest widths and a
//! pure `digest()` function over a byte range.
//!
//! # Algorithms
//!
//! - **CRC family**: CRC7, CRC16, CRC32, CRC32C (portable or hardware), CRC64
//! - **Cryptographic**: MD5, SHA-256, SHA-512
//! - **Metadata**: no digest; the header records the logical offset, thread id,
//!   write sequence number and timestamp instead
//! - **Pattern**: no digest; the payload is compared against the fill pattern
//! - **None / Null**: verification disabled / header-free no-op
//!
//! Every function here is stateless and safe to call concurrently on disjoint
//! buffers.

pub mod crc;
pub mod crc32c;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;

pub use self::crc32c::Crc32cBackend;

/// Largest digest any algorithm produces (SHA-512)
pub const MAX_DIGEST_SIZE: usize = 64;

/// Verification algorithm recorded in each verify header
///
/// The discriminants are the on-disk tag values and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum Algorithm {
    /// Verification disabled
    None = 0,
    Md5 = 1,
    Crc64 = 2,
    Crc32c = 3,
    /// CRC32C computed with the hardware instruction (same output as `Crc32c`)
    Crc32cIntel = 4,
    Crc32 = 5,
    Crc16 = 6,
    Crc7 = 7,
    Sha256 = 8,
    Sha512 = 9,
    /// Offset/thread/sequence metadata instead of a digest
    Meta = 10,
    /// Populate nothing, verify nothing
    Null = 11,
    /// Cyclic byte pattern compared directly
    Pattern = 12,
}

impl Algorithm {
    pub const ALL: [Algorithm; 13] = [
        Algorithm::None,
        Algorithm::Md5,
        Algorithm::Crc64,
        Algorithm::Crc32c,
        Algorithm::Crc32cIntel,
        Algorithm::Crc32,
        Algorithm::Crc16,
        Algorithm::Crc7,
        Algorithm::Sha256,
        Algorithm::Sha512,
        Algorithm::Meta,
        Algorithm::Null,
        Algorithm::Pattern,
    ];

    /// On-disk tag
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Decode an on-disk tag
    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.tag() == tag)
    }

    /// Bytes of algorithm-specific payload stored after the base header
    pub const fn digest_size(self) -> usize {
        match self {
            Algorithm::None | Algorithm::Null | Algorithm::Pattern => 0,
            Algorithm::Crc7 => 1,
            Algorithm::Crc16 => 2,
            Algorithm::Crc32 | Algorithm::Crc32c | Algorithm::Crc32cIntel => 4,
            Algorithm::Crc64 => 8,
            Algorithm::Md5 => 16,
            Algorithm::Sha256 => 32,
            Algorithm::Sha512 => 64,
            Algorithm::Meta => 32,
        }
    }

    /// Whether the header payload is a digest over the block's data
    pub fn is_content_digest(self) -> bool {
        !matches!(
            self,
            Algorithm::None | Algorithm::Null | Algorithm::Pattern | Algorithm::Meta
        )
    }

    /// Whether blocks written with this algorithm carry a header at all
    pub fn writes_header(self) -> bool {
        !matches!(self, Algorithm::None | Algorithm::Null)
    }

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Md5 => "md5",
            Algorithm::Crc64 => "crc64",
            Algorithm::Crc32c => "crc32c",
            Algorithm::Crc32cIntel => "crc32c-intel",
            Algorithm::Crc32 => "crc32",
            Algorithm::Crc16 => "crc16",
            Algorithm::Crc7 => "crc7",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
            Algorithm::Meta => "meta",
            Algorithm::Null => "null",
            Algorithm::Pattern => "pattern",
        }
    }

    /// Compute the digest of `data`
    ///
    /// Returns `None` for algorithms that do not digest content.
    /// `Crc32cIntel` always prefers the hardware path; `Crc32c` uses
    /// whichever backend `crc32c_backend` selects.
    pub fn digest(self, data: &[u8], crc32c_backend: Crc32cBackend) -> Option<Digest> {
        let digest = match self {
            Algorithm::Crc7 => Digest::from_slice(&[crc::crc7(data)]),
            Algorithm::Crc16 => Digest::from_slice(&crc::crc16(data).to_le_bytes()),
            Algorithm::Crc32 => Digest::from_slice(&crc::crc32(data).to_le_bytes()),
            Algorithm::Crc32c => {
                Digest::from_slice(&crc32c_backend.checksum(data).to_le_bytes())
            }
            Algorithm::Crc32cIntel => {
                Digest::from_slice(&Crc32cBackend::Hardware.checksum(data).to_le_bytes())
            }
            Algorithm::Crc64 => Digest::from_slice(&crc::crc64(data).to_le_bytes()),
            Algorithm::Md5 => Digest::from_slice(&Md5::digest(data)),
            Algorithm::Sha256 => Digest::from_slice(&Sha256::digest(data)),
            Algorithm::Sha512 => Digest::from_slice(&Sha512::digest(data)),
            Algorithm::None | Algorithm::Null | Algorithm::Pattern | Algorithm::Meta => {
                return None
            }
        };
        debug_assert_eq!(digest.len(), self.digest_size());
        Some(digest)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.name() == lower)
            .ok_or_else(|| anyhow::anyhow!("unknown verify algorithm: {}", s))
    }
}

/// Fixed-capacity digest value
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Digest {
    bytes: [u8; MAX_DIGEST_SIZE],
    len: usize,
}

impl Digest {
    /// Build from a slice of at most [`MAX_DIGEST_SIZE`] bytes
    pub fn from_slice(src: &[u8]) -> Self {
        let len = src.len().min(MAX_DIGEST_SIZE);
        let mut bytes = [0u8; MAX_DIGEST_SIZE];
        bytes[..len].copy_from_slice(&src[..len]);
        Self { bytes, len }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lowercase hex rendering, used in mismatch diagnostics
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}
