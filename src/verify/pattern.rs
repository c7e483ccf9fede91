//! Buffer fill data for verified writes
//!
//! Write buffers are filled either with pseudo-random bytes or with a short
//! repeating byte pattern (1 to 4 bytes). The pattern cycles from the first
//! byte of the buffer; headers are written over it afterwards, so pattern
//! checks start at the phase matching each sub-block's data offset.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Repeating byte pattern of 1..=4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VerifyPattern {
    bytes: [u8; 4],
    len: usize,
}

impl VerifyPattern {
    /// Build from raw bytes; `None` unless 1..=4 bytes are given
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > 4 {
            return None;
        }
        let mut raw = [0u8; 4];
        raw[..bytes.len()].copy_from_slice(bytes);
        Some(Self { bytes: raw, len: bytes.len() })
    }

    /// Parse `0xdeadbeef`-style hex; the lowest-order byte is emitted first
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
        if digits.is_empty() || digits.len() > 8 {
            anyhow::bail!("verify pattern must be 1-4 hex bytes, got '{}'", s);
        }
        let value = u32::from_str_radix(digits, 16)
            .map_err(|e| anyhow::anyhow!("invalid verify pattern '{}': {}", s, e))?;
        let len = (digits.len() + 1) / 2;
        let le = value.to_le_bytes();
        Self::new(&le[..len]).ok_or_else(|| anyhow::anyhow!("invalid verify pattern '{}'", s))
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

    /// Byte expected at absolute buffer position `index`
    #[inline]
    pub fn byte_at(&self, index: usize) -> u8 {
        self.bytes[index % self.len]
    }

    /// Fill `buf` with the pattern, phase 0 at `buf[0]`
    pub fn fill(&self, buf: &mut [u8]) {
        if self.len == 1 {
            buf.fill(self.bytes[0]);
            return;
        }
        for chunk in buf.chunks_mut(self.len) {
            chunk.copy_from_slice(&self.bytes[..chunk.len()]);
        }
    }

    /// Compare `data` against the pattern starting at phase `start`
    pub fn check(&self, data: &[u8], start: usize) -> Result<(), PatternMismatch> {
        for (i, &got) in data.iter().enumerate() {
            let wanted = self.byte_at(start + i);
            if got != wanted {
                return Err(PatternMismatch {
                    index: i,
                    got,
                    wanted,
                    bad_bits: (got ^ wanted).count_ones(),
                });
            }
        }
        Ok(())
    }
}

impl TryFrom<String> for VerifyPattern {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<VerifyPattern> for String {
    fn from(p: VerifyPattern) -> Self {
        p.to_string()
    }
}

impl fmt::Display for VerifyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in self.as_bytes().iter().rev() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// First divergence found by [`VerifyPattern::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMismatch {
    /// Index into the checked data
    pub index: usize,
    pub got: u8,
    pub wanted: u8,
    /// Hamming weight of `got ^ wanted`
    pub bad_bits: u32,
}

/// Fill `buf` with pseudo-random bytes from `rng`
pub fn fill_random<R: RngCore>(rng: &mut R, buf: &mut [u8]) {
    rng.fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders_low_byte_first() {
        let p = VerifyPattern::parse("0xdeadbeef").unwrap();
        assert_eq!(p.as_bytes(), &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(p.to_string(), "0xdeadbeef");

        let p = VerifyPattern::parse("0xab").unwrap();
        assert_eq!(p.as_bytes(), &[0xab]);

        let p = VerifyPattern::parse("abc").unwrap();
        assert_eq!(p.as_bytes(), &[0xbc, 0x0a]);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(VerifyPattern::parse("").is_err());
        assert!(VerifyPattern::parse("0x123456789").is_err());
        assert!(VerifyPattern::parse("zz").is_err());
    }

    #[test]
    fn test_fill_three_byte_pattern() {
        let p = VerifyPattern::new(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 8];
        p.fill(&mut buf);
        assert_eq!(buf, [1, 2, 3, 1, 2, 3, 1, 2]);
        assert!(p.check(&buf[4..], 4).is_ok());
    }

    #[test]
    fn test_check_reports_bad_bits() {
        let p = VerifyPattern::new(&[0xff]).unwrap();
        let mut buf = [0xffu8; 16];
        buf[5] = 0xf0;
        let err = p.check(&buf, 0).unwrap_err();
        assert_eq!(err.index, 5);
        assert_eq!(err.wanted, 0xff);
        assert_eq!(err.got, 0xf0);
        assert_eq!(err.bad_bits, 4);
    }

    #[test]
    fn test_serde_as_string() {
        #[derive(Serialize, Deserialize)]
        struct Wrap {
            p: VerifyPattern,
        }
        let w: Wrap = toml::from_str("p = \"0x1234\"").unwrap();
        assert_eq!(w.p.as_bytes(), &[0x34, 0x12]);
    }
}
