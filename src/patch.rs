//! Compiled patch rules and patch sets.
//!
//! These are the validated, immutable forms the engine consumes. The TOML
//! document shapes live in [`crate::config::schema`] and compile into these.

use crate::signature::Signature;
use crate::transform::Transform;
use semver::VersionReq;
use serde::Serialize;
use std::fmt;

/// Which matches of a signature a rule writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Occurrence {
    #[default]
    First,
    All,
    /// Zero-based index into the ascending match list.
    Nth(usize),
}

impl fmt::Display for Occurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Occurrence::First => write!(f, "first"),
            Occurrence::All => write!(f, "all"),
            Occurrence::Nth(k) => write!(f, "nth({k})"),
        }
    }
}

/// How many matches a rule expects before it is allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredCount {
    Exactly(usize),
    AtLeast(usize),
}

impl RequiredCount {
    /// `"any"` in patch documents: one or more matches.
    pub const ANY: RequiredCount = RequiredCount::AtLeast(1);

    pub fn is_satisfied(self, actual: usize) -> bool {
        match self {
            RequiredCount::Exactly(n) => actual == n,
            RequiredCount::AtLeast(n) => actual >= n,
        }
    }
}

impl Default for RequiredCount {
    fn default() -> Self {
        RequiredCount::Exactly(1)
    }
}

impl fmt::Display for RequiredCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequiredCount::Exactly(n) => write!(f, "exactly {n}"),
            RequiredCount::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// What gets written at a resolved site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replacement {
    Bytes(Vec<u8>),
    Transform(Transform),
}

impl Replacement {
    /// Length written when the region length is not pinned by the rule.
    pub fn natural_len(&self) -> Option<usize> {
        match self {
            Replacement::Bytes(bytes) => Some(bytes.len()),
            Replacement::Transform(t) => t.natural_len(),
        }
    }
}

/// A byte range that must read a specific value after the set is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostCondition {
    /// Absolute buffer offset, or relative to the rule's first write when
    /// `relative` is set.
    pub offset: i64,
    pub relative: bool,
    pub expected: Vec<u8>,
}

impl PostCondition {
    pub fn absolute(offset: usize, expected: impl Into<Vec<u8>>) -> Self {
        Self {
            offset: offset as i64,
            relative: false,
            expected: expected.into(),
        }
    }

    pub fn relative(offset: i64, expected: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            relative: true,
            expected: expected.into(),
        }
    }

    /// Resolve to an absolute offset given the rule's first write position.
    pub fn resolve(&self, first_write: Option<usize>) -> Option<usize> {
        let base = if self.relative {
            first_write? as i64
        } else {
            0
        };
        usize::try_from(base.checked_add(self.offset)?).ok()
    }
}

/// One declarative edit: locate a signature, then overwrite a region near it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRule {
    pub id: String,
    pub signature: Signature,
    pub occurrence: Occurrence,
    /// Signed distance from the match start to the first written byte.
    pub offset_adjustment: i64,
    /// Bytes overwritten per site. `None` derives it, see [`PatchRule::region_len`].
    pub region_len: Option<usize>,
    pub replacement: Replacement,
    pub required_count: RequiredCount,
    pub resize_allowed: bool,
    pub post_conditions: Vec<PostCondition>,
}

impl PatchRule {
    /// A rule that writes `replacement` over the first and only match.
    pub fn new(id: impl Into<String>, signature: Signature, replacement: Replacement) -> Self {
        Self {
            id: id.into(),
            signature,
            occurrence: Occurrence::First,
            offset_adjustment: 0,
            region_len: None,
            replacement,
            required_count: RequiredCount::default(),
            resize_allowed: false,
            post_conditions: Vec::new(),
        }
    }

    pub fn with_occurrence(mut self, occurrence: Occurrence) -> Self {
        self.occurrence = occurrence;
        self
    }

    pub fn with_offset(mut self, offset_adjustment: i64) -> Self {
        self.offset_adjustment = offset_adjustment;
        self
    }

    pub fn with_region_len(mut self, len: usize) -> Self {
        self.region_len = Some(len);
        self
    }

    pub fn with_required_count(mut self, count: RequiredCount) -> Self {
        self.required_count = count;
        self
    }

    pub fn allow_resize(mut self) -> Self {
        self.resize_allowed = true;
        self
    }

    pub fn with_post_condition(mut self, condition: PostCondition) -> Self {
        self.post_conditions.push(condition);
        self
    }

    /// Number of bytes overwritten at each site.
    ///
    /// Explicit `region_len` wins. Otherwise a write at the match start covers
    /// the signature, and an adjusted write covers the replacement's own
    /// width. Falls back to the signature length.
    pub fn region_len(&self) -> usize {
        self.region_len
            .or_else(|| (self.offset_adjustment == 0).then(|| self.signature.len()))
            .or_else(|| self.replacement.natural_len())
            .unwrap_or(self.signature.len())
    }

    /// Whether the region width can be derived without falling back.
    pub fn has_determinate_region(&self) -> bool {
        self.region_len.is_some()
            || self.offset_adjustment == 0
            || self.replacement.natural_len().is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSetMeta {
    pub name: String,
    pub description: Option<String>,
    /// File identity hint, e.g. `RobloxPlayerBeta.exe`.
    pub target: Option<String>,
    /// Client builds this set is authored for.
    pub build_range: Option<VersionReq>,
}

/// Ordered rules applied as one all-or-nothing unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    pub meta: PatchSetMeta,
    pub rules: Vec<PatchRule>,
}

impl PatchSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: PatchSetMeta {
                name: name.into(),
                ..PatchSetMeta::default()
            },
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: PatchRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(text: &str) -> Signature {
        Signature::parse(text).unwrap()
    }

    #[test]
    fn test_required_count() {
        assert!(RequiredCount::Exactly(1).is_satisfied(1));
        assert!(!RequiredCount::Exactly(1).is_satisfied(0));
        assert!(!RequiredCount::Exactly(1).is_satisfied(2));
        assert!(RequiredCount::ANY.is_satisfied(5));
        assert!(!RequiredCount::ANY.is_satisfied(0));
    }

    #[test]
    fn test_region_len_defaults_to_signature() {
        let rule = PatchRule::new(
            "r",
            sig("DE AD ?? BE EF"),
            Replacement::Bytes(vec![0xDE, 0xAD, 0xFF, 0xBE, 0xEF]),
        );
        assert_eq!(rule.region_len(), 5);
    }

    #[test]
    fn test_region_len_with_offset_uses_replacement_width() {
        let rule = PatchRule::new(
            "r",
            sig("85 C0 74 ??"),
            Replacement::Transform(Transform::JmpShort),
        )
        .with_offset(2);
        assert_eq!(rule.region_len(), 2);
        assert!(rule.has_determinate_region());
    }

    #[test]
    fn test_region_len_undeterminable() {
        let rule = PatchRule::new(
            "r",
            sig("85 C0 74 ??"),
            Replacement::Transform(Transform::Nop { len: None }),
        )
        .with_offset(2);
        assert!(!rule.has_determinate_region());
    }

    #[test]
    fn test_post_condition_resolve() {
        assert_eq!(PostCondition::absolute(12, vec![0xFF]).resolve(None), Some(12));
        assert_eq!(PostCondition::relative(2, vec![0xFF]).resolve(Some(10)), Some(12));
        assert_eq!(PostCondition::relative(-11, vec![0xFF]).resolve(Some(10)), None);
        assert_eq!(PostCondition::relative(0, vec![0xFF]).resolve(None), None);
    }
}
