//! Workload-level enums and size parsing helpers

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// IO engine type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    /// pread/pwrite
    #[default]
    Sync,
    /// splice through a kernel pipe
    Splice,
}

/// File locking mode shared by workers addressing the same file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileLockMode {
    #[default]
    None,
    /// One worker at a time, reads and writes alike
    Exclusive,
    /// Shared for readers, exclusive for writers
    ReadWrite,
}

/// Offset ordering within a target's IO window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessPattern {
    #[default]
    Sequential,
    Random,
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineType::Sync => write!(f, "sync"),
            EngineType::Splice => write!(f, "splice"),
        }
    }
}

impl fmt::Display for FileLockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileLockMode::None => write!(f, "none"),
            FileLockMode::Exclusive => write!(f, "exclusive"),
            FileLockMode::ReadWrite => write!(f, "readwrite"),
        }
    }
}

impl fmt::Display for AccessPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessPattern::Sequential => write!(f, "sequential"),
            AccessPattern::Random => write!(f, "random"),
        }
    }
}

/// Parse a size string (e.g., "4k", "1M", "10G") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with('k') || s.ends_with("kb") {
        (s.trim_end_matches("kb").trim_end_matches('k'), 1024u64)
    } else if s.ends_with('m') || s.ends_with("mb") {
        (s.trim_end_matches("mb").trim_end_matches('m'), 1024 * 1024)
    } else if s.ends_with('g') || s.ends_with("gb") {
        (s.trim_end_matches("gb").trim_end_matches('g'), 1024 * 1024 * 1024)
    } else if s.ends_with('t') || s.ends_with("tb") {
        (s.trim_end_matches("tb").trim_end_matches('t'), 1024 * 1024 * 1024 * 1024)
    } else {
        (s.trim_end_matches('b'), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid size format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size overflows: {}", s))
}

/// Format bytes as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB && bytes % TB == 0 {
        format!("{}T", bytes / TB)
    } else if bytes >= GB && bytes % GB == 0 {
        format!("{}G", bytes / GB)
    } else if bytes >= MB && bytes % MB == 0 {
        format!("{}M", bytes / MB)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{}K", bytes / KB)
    } else {
        format!("{}B", bytes)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Bytes(u64),
    Text(String),
}

impl RawSize {
    fn into_bytes<E: serde::de::Error>(self) -> std::result::Result<u64, E> {
        match self {
            RawSize::Bytes(n) => Ok(n),
            RawSize::Text(s) => parse_size(&s).map_err(|e| E::custom(format!("{:#}", e))),
        }
    }
}

/// Serde helper: sizes may be written as integers or suffixed strings
pub fn deserialize_size<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    use serde::de::Error;

    let bytes = RawSize::deserialize(d)?.into_bytes::<D::Error>()?;
    T::try_from(bytes).map_err(|_| D::Error::custom(format!("size {} out of range", bytes)))
}

/// Optional variant of [`deserialize_size`]
pub fn deserialize_opt_size<'de, D>(d: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawSize>::deserialize(d)?
        .map(RawSize::into_bytes::<D::Error>)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("4KB").unwrap(), 4096);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("512b").unwrap(), 512);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999t").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(4096), "4K");
        assert_eq!(format_bytes(64 * 1024 * 1024), "64M");
        assert_eq!(format_bytes(1000), "1000B");
    }

    #[test]
    fn test_size_serde_accepts_both_forms() {
        #[derive(Deserialize)]
        struct S {
            #[serde(deserialize_with = "deserialize_size")]
            a: u64,
            #[serde(deserialize_with = "deserialize_size")]
            b: usize,
            #[serde(default, deserialize_with = "deserialize_opt_size")]
            c: Option<u64>,
        }

        let s: S = ::toml::from_str("a = \"64k\"\nb = 512").unwrap();
        assert_eq!(s.a, 65536);
        assert_eq!(s.b, 512);
        assert_eq!(s.c, None);

        let s: S = ::toml::from_str("a = 1\nb = \"1m\"\nc = \"2m\"").unwrap();
        assert_eq!(s.c, Some(2 * 1024 * 1024));
    }
}
