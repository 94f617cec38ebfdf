//! Named byte transforms.
//!
//! A rule can compute its replacement from the bytes it overwrites instead of
//! carrying literal bytes. This keeps rules portable across builds where the
//! overwritten bytes differ, e.g. a conditional jump whose displacement moves
//! between versions.
//!
//! | id          | params                  | effect                                      |
//! |-------------|-------------------------|---------------------------------------------|
//! | `nop`       | `len?`                  | `0x90` over the region                      |
//! | `fill`      | `byte`, `len?`          | `byte` over the region                      |
//! | `jmp-short` |                         | `74/75 rel8` becomes `EB rel8`              |
//! | `jmp-near`  |                         | `0F 84/85 rel32` becomes `90 E9 rel32`      |
//! | `ascii-pad` | `text`, `pad?`          | `text` padded with `pad` (default `.`)      |
//! | `xor`       | `key`, `len?`           | region XOR `key`                            |

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Known transform identifiers.
pub const TRANSFORM_IDS: &[&str] = &["nop", "fill", "jmp-short", "jmp-near", "ascii-pad", "xor"];

const NOP: u8 = 0x90;
const JE_SHORT: u8 = 0x74;
const JNE_SHORT: u8 = 0x75;
const JMP_SHORT: u8 = 0xEB;
const TWO_BYTE_PREFIX: u8 = 0x0F;
const JE_NEAR: u8 = 0x84;
const JNE_NEAR: u8 = 0x85;
const JMP_NEAR: u8 = 0xE9;

/// Largest `len` a transform may be given.
pub const MAX_LEN: usize = 16 * 1024 * 1024;

/// A raw parameter value as written in a patch document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v:?}"),
        }
    }
}

pub type TransformParams = BTreeMap<String, ParamValue>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("unknown transform '{id}'{}", suggestion_suffix(.suggestion))]
    Unknown {
        id: String,
        suggestion: Option<String>,
    },

    #[error("transform '{transform}' requires parameter '{param}'")]
    MissingParam {
        transform: &'static str,
        param: &'static str,
    },

    #[error("transform '{transform}' has invalid parameter '{param}': {message}")]
    InvalidParam {
        transform: &'static str,
        param: String,
        message: String,
    },

    #[error("transform '{transform}' expected {expected} but found {found}")]
    UnexpectedBytes {
        transform: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("text of {text_len} bytes does not fit a {region_len}-byte region")]
    TextTooLong { text_len: usize, region_len: usize },
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean '{s}'?)"),
        None => String::new(),
    }
}

/// A compiled transform with typed parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    Nop { len: Option<usize> },
    Fill { byte: u8, len: Option<usize> },
    JmpShort,
    JmpNear,
    AsciiPad { text: String, pad: u8 },
    Xor { key: u8, len: Option<usize> },
}

impl Transform {
    /// Compile a transform id and its parameters.
    ///
    /// Unknown ids carry the closest known id as a suggestion.
    pub fn from_params(id: &str, params: &TransformParams) -> Result<Self, TransformError> {
        let transform = match id {
            "nop" => Transform::Nop {
                len: optional_len("nop", params)?,
            },
            "fill" => Transform::Fill {
                byte: required_byte("fill", "byte", params)?,
                len: optional_len("fill", params)?,
            },
            "jmp-short" => Transform::JmpShort,
            "jmp-near" => Transform::JmpNear,
            "ascii-pad" => {
                let text = match params.get("text") {
                    Some(ParamValue::Text(t)) => t.clone(),
                    Some(other) => {
                        return Err(TransformError::InvalidParam {
                            transform: "ascii-pad",
                            param: "text".to_string(),
                            message: format!("expected a string, got {other}"),
                        })
                    }
                    None => {
                        return Err(TransformError::MissingParam {
                            transform: "ascii-pad",
                            param: "text",
                        })
                    }
                };
                let pad = match params.get("pad") {
                    None => b'.',
                    Some(ParamValue::Text(p)) if p.len() == 1 => p.as_bytes()[0],
                    Some(_) => byte_param("ascii-pad", "pad", params)?,
                };
                Transform::AsciiPad { text, pad }
            }
            "xor" => Transform::Xor {
                key: required_byte("xor", "key", params)?,
                len: optional_len("xor", params)?,
            },
            _ => {
                return Err(TransformError::Unknown {
                    id: id.to_string(),
                    suggestion: suggest(id),
                })
            }
        };

        let known: &[&str] = match transform {
            Transform::Nop { .. } => &["len"],
            Transform::Fill { .. } => &["byte", "len"],
            Transform::Xor { .. } => &["key", "len"],
            Transform::JmpShort | Transform::JmpNear => &[],
            Transform::AsciiPad { .. } => &["text", "pad"],
        };
        if let Some(unknown) = params.keys().find(|k| !known.contains(&k.as_str())) {
            return Err(TransformError::InvalidParam {
                transform: transform.id(),
                param: unknown.clone(),
                message: "unknown parameter".to_string(),
            });
        }

        Ok(transform)
    }

    pub fn id(&self) -> &'static str {
        match self {
            Transform::Nop { .. } => "nop",
            Transform::Fill { .. } => "fill",
            Transform::JmpShort => "jmp-short",
            Transform::JmpNear => "jmp-near",
            Transform::AsciiPad { .. } => "ascii-pad",
            Transform::Xor { .. } => "xor",
        }
    }

    /// Width this transform writes when the rule does not pin a region.
    pub fn natural_len(&self) -> Option<usize> {
        match self {
            Transform::Nop { len } | Transform::Fill { len, .. } | Transform::Xor { len, .. } => {
                *len
            }
            Transform::JmpShort => Some(2),
            Transform::JmpNear => Some(6),
            Transform::AsciiPad { text, .. } => Some(text.len()),
        }
    }

    /// Number of bytes [`apply`](Self::apply) produces for a region of
    /// `region_len` bytes.
    pub fn output_len(&self, region_len: usize) -> usize {
        match self {
            Transform::Nop { len } | Transform::Fill { len, .. } => len.unwrap_or(region_len),
            _ => region_len,
        }
    }

    /// Compute replacement bytes for `region`.
    pub fn apply(&self, region: &[u8]) -> Result<Vec<u8>, TransformError> {
        match self {
            Transform::Nop { len } => Ok(vec![NOP; len.unwrap_or(region.len())]),
            Transform::Fill { byte, len } => Ok(vec![*byte; len.unwrap_or(region.len())]),
            Transform::Xor { key, len } => {
                let width = len.unwrap_or(region.len()).min(region.len());
                let mut out = region.to_vec();
                out[..width].iter_mut().for_each(|b| *b ^= key);
                Ok(out)
            }
            Transform::JmpShort => match region {
                [JE_SHORT | JNE_SHORT | JMP_SHORT, rest @ ..] if !rest.is_empty() => {
                    let mut out = region.to_vec();
                    out[0] = JMP_SHORT;
                    Ok(out)
                }
                _ => Err(TransformError::UnexpectedBytes {
                    transform: "jmp-short",
                    expected: "74/75 rel8",
                    found: hex_preview(region),
                }),
            },
            Transform::JmpNear => match region {
                [TWO_BYTE_PREFIX, JE_NEAR | JNE_NEAR, _, _, _, _, ..] => {
                    let mut out = region.to_vec();
                    out[0] = NOP;
                    out[1] = JMP_NEAR;
                    Ok(out)
                }
                [NOP, JMP_NEAR, _, _, _, _, ..] => Ok(region.to_vec()),
                _ => Err(TransformError::UnexpectedBytes {
                    transform: "jmp-near",
                    expected: "0F 84/85 rel32",
                    found: hex_preview(region),
                }),
            },
            Transform::AsciiPad { text, pad } => {
                if text.len() > region.len() {
                    return Err(TransformError::TextTooLong {
                        text_len: text.len(),
                        region_len: region.len(),
                    });
                }
                let mut out = text.as_bytes().to_vec();
                out.resize(region.len(), *pad);
                Ok(out)
            }
        }
    }
}

/// Closest known transform id, if any is reasonably close.
fn suggest(id: &str) -> Option<String> {
    TRANSFORM_IDS
        .iter()
        .map(|known| (known, strsim::normalized_levenshtein(id, known)))
        .filter(|(_, score)| *score >= 0.5)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(known, _)| known.to_string())
}

fn optional_len(
    transform: &'static str,
    params: &TransformParams,
) -> Result<Option<usize>, TransformError> {
    match params.get("len") {
        None => Ok(None),
        Some(ParamValue::Int(n)) => usize::try_from(*n)
            .ok()
            .filter(|len| (1..=MAX_LEN).contains(len))
            .map(Some)
            .ok_or_else(|| TransformError::InvalidParam {
                transform,
                param: "len".to_string(),
                message: format!("expected an integer from 1 to {MAX_LEN}, got {n}"),
            }),
        Some(other) => Err(TransformError::InvalidParam {
            transform,
            param: "len".to_string(),
            message: format!("expected a positive integer, got {other}"),
        }),
    }
}

fn required_byte(
    transform: &'static str,
    param: &'static str,
    params: &TransformParams,
) -> Result<u8, TransformError> {
    if !params.contains_key(param) {
        return Err(TransformError::MissingParam { transform, param });
    }
    byte_param(transform, param, params)
}

/// A byte given as an integer (`144`) or a hex string (`"90"`, `"0x90"`).
fn byte_param(
    transform: &'static str,
    param: &'static str,
    params: &TransformParams,
) -> Result<u8, TransformError> {
    let invalid = |message: String| TransformError::InvalidParam {
        transform,
        param: param.to_string(),
        message,
    };
    match params.get(param) {
        Some(ParamValue::Int(n)) => {
            u8::try_from(*n).map_err(|_| invalid(format!("{n} is not a byte value")))
        }
        Some(ParamValue::Text(s)) => {
            let digits = s.trim().trim_start_matches("0x");
            let valid =
                matches!(digits.len(), 1 | 2) && digits.bytes().all(|b| b.is_ascii_hexdigit());
            valid
                .then(|| u8::from_str_radix(digits, 16).ok())
                .flatten()
                .ok_or_else(|| invalid(format!("'{s}' is not a hex byte")))
        }
        None => Err(TransformError::MissingParam { transform, param }),
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    let shown: Vec<String> = bytes.iter().take(8).map(|b| format!("{b:02X}")).collect();
    if shown.is_empty() {
        "nothing".to_string()
    } else {
        shown.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, ParamValue)]) -> TransformParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_nop_fills_region() {
        let t = Transform::from_params("nop", &TransformParams::new()).unwrap();
        assert_eq!(t.apply(&[0x74, 0x05]).unwrap(), vec![0x90, 0x90]);
        assert_eq!(t.natural_len(), None);
    }

    #[test]
    fn test_fill_accepts_hex_string_byte() {
        let t = Transform::from_params("fill", &params(&[("byte", ParamValue::Text("CC".into()))]))
            .unwrap();
        assert_eq!(t.apply(&[0, 0, 0]).unwrap(), vec![0xCC; 3]);
    }

    #[test]
    fn test_fill_requires_byte() {
        let err = Transform::from_params("fill", &TransformParams::new()).unwrap_err();
        assert_eq!(
            err,
            TransformError::MissingParam {
                transform: "fill",
                param: "byte"
            }
        );
    }

    #[test]
    fn test_jmp_short_keeps_displacement() {
        let t = Transform::JmpShort;
        assert_eq!(t.apply(&[0x74, 0x1A]).unwrap(), vec![0xEB, 0x1A]);
        assert_eq!(t.apply(&[0x75, 0x03]).unwrap(), vec![0xEB, 0x03]);
        assert!(matches!(
            t.apply(&[0x90, 0x03]),
            Err(TransformError::UnexpectedBytes { .. })
        ));
    }

    #[test]
    fn test_jmp_near_rewrites_conditional() {
        let t = Transform::JmpNear;
        let region = [0x0F, 0x84, 0x10, 0x20, 0x00, 0x00];
        assert_eq!(
            t.apply(&region).unwrap(),
            vec![0x90, 0xE9, 0x10, 0x20, 0x00, 0x00]
        );
        assert_eq!(t.natural_len(), Some(6));
    }

    #[test]
    fn test_ascii_pad_pads_to_region() {
        let t = Transform::from_params(
            "ascii-pad",
            &params(&[("text", ParamValue::Text("revive".into()))]),
        )
        .unwrap();
        assert_eq!(t.apply(b"roblox.com").unwrap(), b"revive....".to_vec());
    }

    #[test]
    fn test_ascii_pad_rejects_long_text() {
        let t = Transform::AsciiPad {
            text: "much-too-long.example".into(),
            pad: b'.',
        };
        assert!(matches!(
            t.apply(b"roblox.com"),
            Err(TransformError::TextTooLong { .. })
        ));
    }

    #[test]
    fn test_xor_region() {
        let t = Transform::from_params("xor", &params(&[("key", ParamValue::Int(0xFF))])).unwrap();
        assert_eq!(t.apply(&[0x00, 0x0F]).unwrap(), vec![0xFF, 0xF0]);
    }

    #[test]
    fn test_unknown_transform_suggests_closest() {
        let err = Transform::from_params("jmp-shrt", &TransformParams::new()).unwrap_err();
        assert_eq!(
            err,
            TransformError::Unknown {
                id: "jmp-shrt".into(),
                suggestion: Some("jmp-short".into()),
            }
        );
        assert!(err.to_string().contains("did you mean 'jmp-short'"));
    }

    #[test]
    fn test_unknown_param_rejected() {
        let err = Transform::from_params("jmp-short", &params(&[("len", ParamValue::Int(2))]))
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidParam { .. }));
    }

    #[test]
    fn test_signed_hex_byte_rejected() {
        for text in ["+F", "-1", "0x+F", ""] {
            let err = Transform::from_params("fill", &params(&[("byte", ParamValue::Text(text.into()))]))
                .unwrap_err();
            assert!(matches!(err, TransformError::InvalidParam { .. }), "{text:?}");
        }
    }

    #[test]
    fn test_oversized_len_rejected() {
        for len in [1_000_000_000_000, (MAX_LEN + 1) as i64, 0, -4] {
            let err = Transform::from_params("nop", &params(&[("len", ParamValue::Int(len))]))
                .unwrap_err();
            assert!(matches!(err, TransformError::InvalidParam { .. }), "{len}");
        }
        let t = Transform::from_params("nop", &params(&[("len", ParamValue::Int(4))])).unwrap();
        assert_eq!(t.output_len(2), 4);
    }
}
