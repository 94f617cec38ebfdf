use crate::buffer::WorkingBuffer;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// The fundamental edit primitive: verified byte-span replacement.
///
/// Every rule resolves down to one `ByteEdit` per selected site. The edit
/// records what it expects to overwrite, so a buffer that changed between
/// resolution and application is rejected instead of silently corrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "ByteEdit does nothing until applied"]
pub struct ByteEdit {
    /// First byte overwritten
    pub offset: usize,
    /// Number of bytes overwritten
    pub len: usize,
    /// Bytes written in place of [offset, offset + len)
    pub replacement: Vec<u8>,
    /// Verification of what we expect to find before applying
    pub expected_before: EditVerification,
}

/// Verification strategy for edit safety.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditVerification {
    /// Exact bytes required
    ExactMatch(Vec<u8>),
    /// xxh3 hash of the expected bytes (for large spans)
    Hash(u64),
}

impl EditVerification {
    pub fn matches(&self, bytes: &[u8]) -> bool {
        match self {
            EditVerification::ExactMatch(expected) => bytes == expected.as_slice(),
            EditVerification::Hash(expected_hash) => xxh3_64(bytes) == *expected_hash,
        }
    }

    /// Create verification from bytes, using a hash for spans over 1KB.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() > 1024 {
            EditVerification::Hash(xxh3_64(bytes))
        } else {
            EditVerification::ExactMatch(bytes.to_vec())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    #[error("bytes at [{offset:#x}, +{len}) differ from what the edit was resolved against")]
    BeforeBytesMismatch { offset: usize, len: usize },

    #[error("invalid byte range [{start}, {end}) in buffer of length {buffer_len}")]
    InvalidByteRange {
        start: usize,
        end: usize,
        buffer_len: usize,
    },

    #[error("edits overlap: [{first_start:#x}, {first_end:#x}) and [{second_start:#x}, ..)")]
    Overlapping {
        first_start: usize,
        first_end: usize,
        second_start: usize,
    },
}

/// Result of applying one edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditResult {
    /// Bytes were written
    Applied { offset: usize, bytes_changed: usize },
    /// Region already held the replacement bytes
    AlreadyApplied { offset: usize },
}

impl ByteEdit {
    /// Create an edit expecting `current` at `offset`.
    pub fn new(offset: usize, current: &[u8], replacement: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            len: current.len(),
            replacement: replacement.into(),
            expected_before: EditVerification::from_bytes(current),
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Change in buffer length once applied.
    pub fn delta(&self) -> i64 {
        self.replacement.len() as i64 - self.len as i64
    }

    pub fn is_resize(&self) -> bool {
        self.replacement.len() != self.len
    }

    /// Validate the edit against the current buffer contents.
    ///
    /// Returns the bytes currently at the span.
    fn validate<'a>(&self, content: &'a [u8]) -> Result<&'a [u8], EditError> {
        let end = self
            .offset
            .checked_add(self.len)
            .filter(|end| *end <= content.len())
            .ok_or(EditError::InvalidByteRange {
                start: self.offset,
                end: self.offset.saturating_add(self.len),
                buffer_len: content.len(),
            })?;

        let current = &content[self.offset..end];

        // Idempotency: already holds the replacement
        if current == self.replacement.as_slice() {
            return Ok(current);
        }

        if !self.expected_before.matches(current) {
            return Err(EditError::BeforeBytesMismatch {
                offset: self.offset,
                len: self.len,
            });
        }

        Ok(current)
    }
}

/// Apply edits to one buffer as a unit.
///
/// All edits are validated and checked for overlap before the first byte is
/// written, then applied back-to-front so earlier offsets stay valid when an
/// edit resizes its span. Results are returned in ascending offset order.
pub fn apply_batch(
    buffer: &mut WorkingBuffer,
    mut edits: Vec<ByteEdit>,
) -> Result<Vec<EditResult>, EditError> {
    if edits.is_empty() {
        return Ok(Vec::new());
    }

    edits.sort_by_key(|edit| edit.offset);

    for edit in &edits {
        edit.validate(buffer.as_slice())?;
    }

    for pair in edits.windows(2) {
        let (earlier, later) = (&pair[0], &pair[1]);
        if earlier.end() > later.offset {
            return Err(EditError::Overlapping {
                first_start: earlier.offset,
                first_end: earlier.end(),
                second_start: later.offset,
            });
        }
    }

    let mut results = Vec::with_capacity(edits.len());
    for edit in edits.iter().rev() {
        let current = &buffer.as_slice()[edit.offset..edit.end()];
        if current == edit.replacement.as_slice() {
            results.push(EditResult::AlreadyApplied {
                offset: edit.offset,
            });
            continue;
        }

        buffer.splice(edit.offset, edit.len, &edit.replacement);
        results.push(EditResult::Applied {
            offset: edit.offset,
            bytes_changed: edit.replacement.len(),
        });
    }

    results.reverse();
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_verification_exact_match() {
        let verify = EditVerification::ExactMatch(vec![0x74, 0x05]);
        assert!(verify.matches(&[0x74, 0x05]));
        assert!(!verify.matches(&[0x75, 0x05]));
    }

    #[test]
    fn test_edit_verification_hash() {
        let bytes = [0xAB; 16];
        let verify = EditVerification::Hash(xxh3_64(&bytes));
        assert!(verify.matches(&bytes));
        assert!(!verify.matches(&[0xAC; 16]));
    }

    #[test]
    fn test_edit_verification_from_bytes_large() {
        assert!(matches!(
            EditVerification::from_bytes(&[0u8; 8]),
            EditVerification::ExactMatch(_)
        ));
        assert!(matches!(
            EditVerification::from_bytes(&vec![0u8; 2000]),
            EditVerification::Hash(_)
        ));
    }

    #[test]
    fn test_invalid_range_rejected() {
        let mut buffer = WorkingBuffer::new(vec![0u8; 4]);
        let edit = ByteEdit {
            offset: 3,
            len: 4,
            replacement: vec![1; 4],
            expected_before: EditVerification::ExactMatch(vec![0; 4]),
        };
        let err = apply_batch(&mut buffer, vec![edit]).unwrap_err();
        assert!(matches!(err, EditError::InvalidByteRange { .. }));
        assert_eq!(buffer.as_slice(), &[0u8; 4]);
    }

    #[test]
    fn test_before_bytes_mismatch_rejected() {
        let mut buffer = WorkingBuffer::new(vec![0x74, 0x05]);
        let edit = ByteEdit::new(0, &[0x75, 0x05], vec![0xEB, 0x05]);
        let err = apply_batch(&mut buffer, vec![edit]).unwrap_err();
        assert_eq!(err, EditError::BeforeBytesMismatch { offset: 0, len: 2 });
    }

    #[test]
    fn test_batch_same_length() {
        let mut buffer = WorkingBuffer::new(b"aaXXbbYYcc".to_vec());
        let edits = vec![
            ByteEdit::new(6, b"YY", b"yy".to_vec()),
            ByteEdit::new(2, b"XX", b"xx".to_vec()),
        ];
        let results = apply_batch(&mut buffer, edits).unwrap();
        assert_eq!(buffer.as_slice(), b"aaxxbbyycc");
        assert_eq!(
            results,
            vec![
                EditResult::Applied {
                    offset: 2,
                    bytes_changed: 2
                },
                EditResult::Applied {
                    offset: 6,
                    bytes_changed: 2
                },
            ]
        );
    }

    #[test]
    fn test_batch_resize_keeps_earlier_offsets() {
        let mut buffer = WorkingBuffer::new(b"aXbYc".to_vec());
        let edits = vec![
            ByteEdit::new(1, b"X", b"XXX".to_vec()),
            ByteEdit::new(3, b"Y", Vec::new()),
        ];
        apply_batch(&mut buffer, edits).unwrap();
        assert_eq!(buffer.as_slice(), b"aXXXbc");
    }

    #[test]
    fn test_overlapping_edits_rejected() {
        let mut buffer = WorkingBuffer::new(vec![0xAA; 3]);
        let edits = vec![
            ByteEdit::new(0, &[0xAA, 0xAA], vec![0, 0]),
            ByteEdit::new(1, &[0xAA, 0xAA], vec![0, 0]),
        ];
        let err = apply_batch(&mut buffer, edits).unwrap_err();
        assert!(matches!(err, EditError::Overlapping { .. }));
        assert_eq!(buffer.as_slice(), &[0xAA; 3]);
    }

    #[test]
    fn test_already_applied_edit() {
        let mut buffer = WorkingBuffer::new(vec![0xEB, 0x05]);
        let edit = ByteEdit::new(0, &[0x74, 0x05], vec![0xEB, 0x05]);
        let results = apply_batch(&mut buffer, vec![edit]).unwrap();
        assert_eq!(results, vec![EditResult::AlreadyApplied { offset: 0 }]);
    }
}
