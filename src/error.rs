use crate::checksum::Checksum;
use crate::edit::EditError;
use crate::patch::RequiredCount;
use crate::transform::TransformError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Everything that can stop a patch set from being committed.
///
/// The library never logs or retries; every failure is returned to the
/// caller as one of these, and surfaces in the
/// [`ApplicationReport`](crate::report::ApplicationReport).
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rule '{rule}' matched {actual} location(s), expected {expected}")]
    PatternMismatch {
        rule: String,
        expected: RequiredCount,
        actual: usize,
    },

    #[error(
        "rule '{rule}' would resize the region at {offset:#x} from {region_len} to {replacement_len} bytes{}",
        resize_hint(.safe_mode)
    )]
    UnsafeResize {
        rule: String,
        offset: usize,
        region_len: usize,
        replacement_len: usize,
        safe_mode: bool,
    },

    #[error("rule '{rule}' writes {len} byte(s) at {start} outside a buffer of {buffer_len} bytes")]
    OutOfBounds {
        rule: String,
        start: i64,
        len: usize,
        buffer_len: usize,
    },

    #[error("rule '{rule}' selects overlapping sites at {first:#x} and {second:#x}")]
    OverlappingWrites {
        rule: String,
        first: usize,
        second: usize,
    },

    #[error("rule '{rule}': {source}")]
    Transform {
        rule: String,
        #[source]
        source: TransformError,
    },

    #[error("rule '{rule}': {source}")]
    Edit {
        rule: String,
        #[source]
        source: EditError,
    },

    #[error("post-condition of rule '{rule}' failed at {offset:#x}: expected {expected}, found {found}")]
    PostConditionFailed {
        rule: String,
        offset: usize,
        expected: String,
        found: String,
    },

    #[error("{} was already patched by this tool (checksum {checksum})", .path.display())]
    AlreadyPatched { path: PathBuf, checksum: Checksum },

    #[error("patch set '{set}' targets client builds {range}, not {build}")]
    BuildExcluded {
        set: String,
        build: String,
        range: String,
    },

    #[error("operation cancelled before commit")]
    Cancelled,

    #[error("written file {} does not verify: expected checksum {expected}, found {found}", .path.display())]
    CommitVerification {
        path: PathBuf,
        expected: Checksum,
        found: Checksum,
    },

    #[error("backup {} is corrupt: expected checksum {expected}, found {found}", .path.display())]
    BackupCorrupt {
        path: PathBuf,
        expected: Checksum,
        found: Checksum,
    },

    #[error(
        "ROLLBACK FAILED for {}: {reason}; the original file may be damaged, backup at {}",
        .path.display(),
        backup_display(.backup)
    )]
    RollbackFailed {
        path: PathBuf,
        backup: Option<PathBuf>,
        reason: String,
    },
}

fn resize_hint(safe_mode: &bool) -> &'static str {
    if *safe_mode {
        " (resize operations are refused in safe mode)"
    } else {
        ""
    }
}

fn backup_display(backup: &Option<PathBuf>) -> String {
    match backup {
        Some(path) => path.display().to_string(),
        None => "<none>".to_string(),
    }
}

/// Failure classification, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Cancelled,
    BuildExcluded,
    AlreadyPatched,
    PatternMismatch,
    UnsafeResize,
    OutOfBounds,
    OverlappingWrites,
    Transform,
    Edit,
    PostConditionFailed,
    Io,
    CommitVerification,
    BackupCorrupt,
    RollbackFailed,
}

impl PatchError {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        PatchError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PatchError::Io { .. } => ErrorKind::Io,
            PatchError::PatternMismatch { .. } => ErrorKind::PatternMismatch,
            PatchError::UnsafeResize { .. } => ErrorKind::UnsafeResize,
            PatchError::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            PatchError::OverlappingWrites { .. } => ErrorKind::OverlappingWrites,
            PatchError::Transform { .. } => ErrorKind::Transform,
            PatchError::Edit { .. } => ErrorKind::Edit,
            PatchError::PostConditionFailed { .. } => ErrorKind::PostConditionFailed,
            PatchError::AlreadyPatched { .. } => ErrorKind::AlreadyPatched,
            PatchError::BuildExcluded { .. } => ErrorKind::BuildExcluded,
            PatchError::Cancelled => ErrorKind::Cancelled,
            PatchError::CommitVerification { .. } => ErrorKind::CommitVerification,
            PatchError::BackupCorrupt { .. } => ErrorKind::BackupCorrupt,
            PatchError::RollbackFailed { .. } => ErrorKind::RollbackFailed,
        }
    }

    /// Id of the rule that failed, if the failure belongs to one.
    pub fn rule(&self) -> Option<&str> {
        match self {
            PatchError::PatternMismatch { rule, .. }
            | PatchError::UnsafeResize { rule, .. }
            | PatchError::OutOfBounds { rule, .. }
            | PatchError::OverlappingWrites { rule, .. }
            | PatchError::Transform { rule, .. }
            | PatchError::Edit { rule, .. }
            | PatchError::PostConditionFailed { rule, .. } => Some(rule),
            _ => None,
        }
    }

    /// The original file may no longer hold its original bytes.
    pub fn is_critical(&self) -> bool {
        self.kind() == ErrorKind::RollbackFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_failed_is_most_severe() {
        let all = [
            ErrorKind::Cancelled,
            ErrorKind::PatternMismatch,
            ErrorKind::PostConditionFailed,
            ErrorKind::Io,
            ErrorKind::BackupCorrupt,
        ];
        assert!(all.iter().all(|k| *k < ErrorKind::RollbackFailed));
        assert_eq!(all.iter().max(), Some(&ErrorKind::BackupCorrupt));
    }

    #[test]
    fn test_pattern_mismatch_message() {
        let err = PatchError::PatternMismatch {
            rule: "trust-check".into(),
            expected: RequiredCount::Exactly(1),
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "rule 'trust-check' matched 2 location(s), expected exactly 1"
        );
        assert_eq!(err.rule(), Some("trust-check"));
        assert_eq!(err.kind(), ErrorKind::PatternMismatch);
    }

    #[test]
    fn test_unsafe_resize_mentions_safe_mode() {
        let err = PatchError::UnsafeResize {
            rule: "domain".into(),
            offset: 0x40,
            region_len: 10,
            replacement_len: 12,
            safe_mode: true,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x40"));
        assert!(msg.contains("safe mode"));
    }

    #[test]
    fn test_rollback_failed_is_critical() {
        let err = PatchError::RollbackFailed {
            path: PathBuf::from("/tmp/client.exe"),
            backup: Some(PathBuf::from("/tmp/client.exe.bak")),
            reason: "permission denied".into(),
        };
        assert!(err.is_critical());
        assert!(err.to_string().starts_with("ROLLBACK FAILED"));
        assert_eq!(err.rule(), None);
    }
}
