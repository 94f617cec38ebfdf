//! xxh3-64 checksums for buffers, backups and fingerprints.
//!
//! Checksums are rendered as 16 lowercase hex digits (`0x` prefix optional on
//! input) so they can be pasted between profile files, sidecars and reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// xxh3-64 digest of a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(u64);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid checksum '{value}': expected up to 16 hex digits")]
pub struct ParseChecksumError {
    pub value: String,
}

impl Checksum {
    /// Hash a buffer.
    pub fn of(bytes: &[u8]) -> Self {
        Checksum(xxh3_64(bytes))
    }

    pub fn from_raw(raw: u64) -> Self {
        Checksum(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Checksum {
    type Err = ParseChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty()
            || digits.len() > 16
            || !digits.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ParseChecksumError {
                value: s.to_string(),
            });
        }

        u64::from_str_radix(digits, 16)
            .map(Checksum)
            .map_err(|_| ParseChecksumError {
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for Checksum {
    type Error = ParseChecksumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_string()
    }
}
