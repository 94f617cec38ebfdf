use crate::signature::Signature;
use std::iter::FusedIterator;

/// Scans a byte buffer for signature matches.
///
/// Matching is a single forward pass: candidate offsets are found by jumping
/// to the next occurrence of the signature's first literal byte, then the
/// full window is checked token by token with early exit on the first
/// mismatch. Matches may overlap.
#[derive(Debug, Clone, Copy)]
pub struct PatternMatcher<'h> {
    haystack: &'h [u8],
}

impl<'h> PatternMatcher<'h> {
    pub fn new(haystack: &'h [u8]) -> Self {
        Self { haystack }
    }

    /// Lazy iterator over match offsets in ascending order.
    ///
    /// The iterator borrows the buffer; calling this again restarts the scan.
    pub fn find_iter<'s>(&self, signature: &'s Signature) -> Matches<'h, 's> {
        Matches {
            haystack: self.haystack,
            signature,
            next: 0,
        }
    }

    /// First match only; stops scanning at the first success.
    pub fn find_first(&self, signature: &Signature) -> Option<usize> {
        self.find_iter(signature).next()
    }

    /// Every match offset in the buffer.
    pub fn find_all(&self, signature: &Signature) -> Vec<usize> {
        self.find_iter(signature).collect()
    }

    pub fn count(&self, signature: &Signature) -> usize {
        self.find_iter(signature).count()
    }

    pub fn has_match(&self, signature: &Signature) -> bool {
        self.find_first(signature).is_some()
    }

    /// Check a single offset.
    pub fn matches_at(&self, signature: &Signature, offset: usize) -> bool {
        offset
            .checked_add(signature.len())
            .and_then(|end| self.haystack.get(offset..end))
            .is_some_and(|window| signature.matches_window(window))
    }
}

/// Iterator returned by [`PatternMatcher::find_iter`].
#[derive(Debug, Clone)]
pub struct Matches<'h, 's> {
    haystack: &'h [u8],
    signature: &'s Signature,
    next: usize,
}

impl Iterator for Matches<'_, '_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let len = self.signature.len();
        let last_start = self.haystack.len().checked_sub(len)?;
        let (anchor_idx, anchor_byte) = self.signature.anchor();

        while self.next <= last_start {
            let window = &self.haystack[self.next + anchor_idx..=last_start + anchor_idx];
            let Some(skip) = window.iter().position(|&b| b == anchor_byte) else {
                self.next = last_start + 1;
                return None;
            };

            let start = self.next + skip;
            self.next = start + 1;

            if self.signature.matches_window(&self.haystack[start..start + len]) {
                return Some(start);
            }
        }

        None
    }
}

impl FusedIterator for Matches<'_, '_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(text: &str) -> Signature {
        Signature::parse(text).unwrap()
    }

    #[test]
    fn test_wildcard_match_at_offset() {
        let mut buf = vec![0u8; 32];
        buf[10..15].copy_from_slice(&[0xDE, 0xAD, 0x00, 0xBE, 0xEF]);

        let matcher = PatternMatcher::new(&buf);
        assert_eq!(matcher.find_all(&sig("DE AD ?? BE EF")), vec![10]);
    }

    #[test]
    fn test_multiple_matches_ascending() {
        let buf = [0x74, 0x05, 0x00, 0x74, 0x10, 0x74, 0x05];
        let matcher = PatternMatcher::new(&buf);
        assert_eq!(matcher.find_all(&sig("74 ??")), vec![0, 3, 5]);
        assert_eq!(matcher.count(&sig("74 ??")), 3);
        assert_eq!(matcher.find_first(&sig("74 ??")), Some(0));
    }

    #[test]
    fn test_overlapping_matches() {
        let buf = [0xAA, 0xAA, 0xAA];
        let matcher = PatternMatcher::new(&buf);
        assert_eq!(matcher.find_all(&sig("AA AA")), vec![0, 1]);
    }

    #[test]
    fn test_leading_wildcards_can_match_at_zero() {
        let buf = [0x01, 0x02, 0x74, 0x03];
        let matcher = PatternMatcher::new(&buf);
        assert_eq!(matcher.find_all(&sig("?? ?? 74")), vec![0]);
        assert_eq!(matcher.find_all(&sig("?? 74")), vec![1]);
    }

    #[test]
    fn test_signature_longer_than_buffer() {
        let buf = [0xDE, 0xAD];
        let matcher = PatternMatcher::new(&buf);
        assert!(matcher.find_all(&sig("DE AD BE")).is_empty());
        assert!(!matcher.has_match(&sig("DE AD BE")));
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        let buf = vec![0u8; 64];
        let matcher = PatternMatcher::new(&buf);
        assert_eq!(matcher.find_first(&sig("FF")), None);
        assert_eq!(matcher.count(&sig("FF")), 0);
    }

    #[test]
    fn test_match_at_end_of_buffer() {
        let buf = [0x00, 0x00, 0xBE, 0xEF];
        let matcher = PatternMatcher::new(&buf);
        assert_eq!(matcher.find_all(&sig("BE EF")), vec![2]);
    }

    #[test]
    fn test_iterator_is_restartable_and_fused() {
        let buf = [0x11, 0x22, 0x11, 0x22];
        let matcher = PatternMatcher::new(&buf);
        let s = sig("11 22");

        let mut it = matcher.find_iter(&s);
        assert_eq!(it.next(), Some(0));
        assert_eq!(it.next(), Some(2));
        assert_eq!(it.next(), None);
        assert_eq!(it.next(), None);

        assert_eq!(matcher.find_iter(&s).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_matches_at() {
        let buf = [0xDE, 0xAD, 0x42, 0xBE, 0xEF];
        let matcher = PatternMatcher::new(&buf);
        let s = sig("DE AD ?? BE EF");
        assert!(matcher.matches_at(&s, 0));
        assert!(!matcher.matches_at(&s, 1));
        assert!(!matcher.matches_at(&s, usize::MAX));
    }
}
