//! Byte signatures with wildcard positions.
//!
//! A signature locates a patch site without knowing its offset in advance.
//! Accepted text forms:
//!
//! ```text
//! DE AD ?? BE EF      // spaced, `??` or `?` for a wildcard
//! DEAD??BEEF          // compact, `??` for a wildcard
//! ```
//!
//! Signatures are immutable once built and always contain at least one
//! literal byte.

use std::fmt;
use thiserror::Error;

/// One position of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteToken {
    /// Matches exactly this byte.
    Literal(u8),
    /// Matches any byte.
    Wildcard,
}

impl ByteToken {
    #[inline]
    pub fn matches(self, byte: u8) -> bool {
        match self {
            ByteToken::Literal(expected) => expected == byte,
            ByteToken::Wildcard => true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is empty")]
    Empty,

    #[error("signature contains only wildcards")]
    NoLiteral,

    #[error("invalid token '{token}' at position {position}")]
    InvalidToken { token: String, position: usize },

    #[error("odd number of hex digits in compact signature")]
    OddLength,

    #[error("wildcards are not allowed in replacement bytes (position {position})")]
    WildcardInBytes { position: usize },
}

/// A compiled byte pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    tokens: Vec<ByteToken>,
    /// Index and value of the first literal token, used to skip ahead while
    /// scanning.
    anchor: (usize, u8),
}

impl Signature {
    /// Build a signature from tokens, rejecting empty and all-wildcard input.
    pub fn new(tokens: Vec<ByteToken>) -> Result<Self, SignatureError> {
        if tokens.is_empty() {
            return Err(SignatureError::Empty);
        }
        let anchor = tokens
            .iter()
            .enumerate()
            .find_map(|(i, t)| match t {
                ByteToken::Literal(b) => Some((i, *b)),
                ByteToken::Wildcard => None,
            })
            .ok_or(SignatureError::NoLiteral)?;
        Ok(Self { tokens, anchor })
    }

    /// Parse the textual form (`"DE AD ?? BE EF"` or `"DEAD??BEEF"`).
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        Self::new(parse_tokens(text)?)
    }

    /// All-literal signature for an exact byte sequence.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        Self::new(bytes.iter().copied().map(ByteToken::Literal).collect())
    }

    /// All-literal signature for an ASCII/UTF-8 string (e.g. an embedded URL).
    pub fn from_ascii(text: &str) -> Result<Self, SignatureError> {
        Self::from_bytes(text.as_bytes())
    }

    pub fn tokens(&self) -> &[ByteToken] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Position and value of the first literal token.
    pub fn anchor(&self) -> (usize, u8) {
        self.anchor
    }

    pub fn literal_count(&self) -> usize {
        self.tokens
            .iter()
            .filter(|t| matches!(t, ByteToken::Literal(_)))
            .count()
    }

    /// Check whether `window` (exactly `len()` bytes) satisfies every token.
    ///
    /// Stops at the first literal mismatch.
    #[inline]
    pub fn matches_window(&self, window: &[u8]) -> bool {
        window.len() == self.tokens.len()
            && self
                .tokens
                .iter()
                .zip(window)
                .all(|(token, &byte)| token.matches(byte))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, token) in self.tokens.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            match token {
                ByteToken::Literal(b) => write!(f, "{b:02X}")?,
                ByteToken::Wildcard => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

/// Parse hex bytes that must not contain wildcards (replacements,
/// post-condition expectations).
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, SignatureError> {
    parse_tokens(text)?
        .into_iter()
        .enumerate()
        .map(|(position, token)| match token {
            ByteToken::Literal(b) => Ok(b),
            ByteToken::Wildcard => Err(SignatureError::WildcardInBytes { position }),
        })
        .collect()
}

fn parse_tokens(text: &str) -> Result<Vec<ByteToken>, SignatureError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SignatureError::Empty);
    }
    if text.contains(char::is_whitespace) {
        parse_spaced(text)
    } else {
        parse_compact(text)
    }
}

fn parse_spaced(text: &str) -> Result<Vec<ByteToken>, SignatureError> {
    text.split_whitespace()
        .enumerate()
        .map(|(position, part)| match part {
            "??" | "?" => Ok(ByteToken::Wildcard),
            _ => match hex_byte(part) {
                Some(b) => Ok(ByteToken::Literal(b)),
                None => Err(SignatureError::InvalidToken {
                    token: part.to_string(),
                    position,
                }),
            },
        })
        .collect()
}

/// Exactly two hex digits, no sign.
fn hex_byte(part: &str) -> Option<u8> {
    if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(part, 16).ok()
}

fn parse_compact(text: &str) -> Result<Vec<ByteToken>, SignatureError> {
    if !text.is_ascii() {
        return Err(SignatureError::InvalidToken {
            token: text.to_string(),
            position: 0,
        });
    }
    if text.len() % 2 != 0 {
        return Err(SignatureError::OddLength);
    }

    text.as_bytes()
        .chunks(2)
        .enumerate()
        .map(|(position, pair)| {
            // ASCII was checked above, so every pair is valid UTF-8.
            let part = std::str::from_utf8(pair).unwrap_or_default();
            if part == "??" {
                return Ok(ByteToken::Wildcard);
            }
            hex_byte(part)
                .map(ByteToken::Literal)
                .ok_or_else(|| SignatureError::InvalidToken {
                    token: part.to_string(),
                    position,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spaced_with_wildcards() {
        let sig = Signature::parse("DE AD ?? BE EF").unwrap();
        assert_eq!(
            sig.tokens(),
            &[
                ByteToken::Literal(0xDE),
                ByteToken::Literal(0xAD),
                ByteToken::Wildcard,
                ByteToken::Literal(0xBE),
                ByteToken::Literal(0xEF),
            ]
        );
        assert_eq!(sig.literal_count(), 4);
    }

    #[test]
    fn test_parse_single_question_mark() {
        let sig = Signature::parse("48 8B 05 ? ? ? ? 48").unwrap();
        assert_eq!(sig.len(), 8);
        assert_eq!(sig.literal_count(), 4);
    }

    #[test]
    fn test_parse_compact() {
        let spaced = Signature::parse("DE AD ?? BE EF").unwrap();
        let compact = Signature::parse("dead??beef").unwrap();
        assert_eq!(spaced, compact);
    }

    #[test]
    fn test_reject_all_wildcards() {
        assert_eq!(
            Signature::parse("?? ?? ??").unwrap_err(),
            SignatureError::NoLiteral
        );
    }

    #[test]
    fn test_reject_empty() {
        assert_eq!(Signature::parse("   ").unwrap_err(), SignatureError::Empty);
        assert_eq!(Signature::from_bytes(&[]).unwrap_err(), SignatureError::Empty);
    }

    #[test]
    fn test_reject_bad_tokens() {
        assert!(matches!(
            Signature::parse("DE XY"),
            Err(SignatureError::InvalidToken { position: 1, .. })
        ));
        assert!(matches!(
            Signature::parse("DEA BE"),
            Err(SignatureError::InvalidToken { position: 0, .. })
        ));
        assert_eq!(Signature::parse("DEA").unwrap_err(), SignatureError::OddLength);
    }

    #[test]
    fn test_reject_signed_tokens() {
        assert!(matches!(
            Signature::parse("DE +F"),
            Err(SignatureError::InvalidToken { position: 1, .. })
        ));
        assert!(matches!(
            Signature::parse("DE+F"),
            Err(SignatureError::InvalidToken { position: 1, .. })
        ));
        assert!(parse_hex_bytes("90 -1").is_err());
    }

    #[test]
    fn test_anchor_skips_leading_wildcards() {
        let sig = Signature::parse("?? ?? 74 ??").unwrap();
        assert_eq!(sig.anchor(), (2, 0x74));
    }

    #[test]
    fn test_display_round_trips_text_form() {
        let sig = Signature::parse("de ad ? be ef").unwrap();
        assert_eq!(sig.to_string(), "DE AD ?? BE EF");
    }

    #[test]
    fn test_from_ascii() {
        let sig = Signature::from_ascii("roblox.com").unwrap();
        assert_eq!(sig.len(), 10);
        assert!(sig.matches_window(b"roblox.com"));
        assert!(!sig.matches_window(b"roblox.org"));
    }

    #[test]
    fn test_parse_hex_bytes_rejects_wildcards() {
        assert_eq!(parse_hex_bytes("90 90 EB").unwrap(), vec![0x90, 0x90, 0xEB]);
        assert_eq!(
            parse_hex_bytes("90 ?? EB").unwrap_err(),
            SignatureError::WildcardInBytes { position: 1 }
        );
    }
}
