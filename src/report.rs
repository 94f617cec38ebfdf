//! Structured outcome of one engine run.

use crate::checksum::Checksum;
use crate::error::{ErrorKind, PatchError};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Per-rule outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RuleStatus {
    /// Bytes were written at every selected site
    Applied,
    /// Every selected site already held the replacement
    AlreadyApplied,
    /// Rule was not evaluated
    Skipped { reason: String },
    /// Rule stopped the run
    Failed { reason: String },
}

impl RuleStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, RuleStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleReport {
    pub id: String,
    #[serde(flatten)]
    pub status: RuleStatus,
    /// Write offsets in the final buffer, ascending.
    pub offsets: Vec<usize>,
}

impl fmt::Display for RuleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            RuleStatus::Applied => {
                write!(f, "{}: applied at ", self.id)?;
                write_offsets(f, &self.offsets)
            }
            RuleStatus::AlreadyApplied => {
                write!(f, "{}: already applied at ", self.id)?;
                write_offsets(f, &self.offsets)
            }
            RuleStatus::Skipped { reason } => write!(f, "{}: skipped ({})", self.id, reason),
            RuleStatus::Failed { reason } => write!(f, "{}: failed - {}", self.id, reason),
        }
    }
}

fn write_offsets(f: &mut fmt::Formatter<'_>, offsets: &[usize]) -> fmt::Result {
    for (idx, offset) in offsets.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{offset:#x}")?;
    }
    Ok(())
}

/// The error that stopped the run, flattened for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub rule: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PatchError> for Failure {
    fn from(error: &PatchError) -> Self {
        Self {
            rule: error.rule().map(str::to_string),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of applying (or checking) one patch set against one buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[must_use = "ApplicationReport should be checked for success/failure"]
pub struct ApplicationReport {
    pub patch_set: String,
    pub target: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub rules: Vec<RuleReport>,
    pub success: bool,
    /// The patched buffer was written to `destination`.
    pub committed: bool,
    /// The target was restored from its snapshot after a failure.
    pub rolled_back: bool,
    pub dry_run: bool,
    pub original_checksum: Checksum,
    /// Checksum of the buffer after all rules, equal to the original on failure.
    pub checksum: Checksum,
    pub length_delta: i64,
    pub failure: Option<Failure>,
}

impl ApplicationReport {
    pub(crate) fn new(patch_set: &str, original_checksum: Checksum) -> Self {
        Self {
            patch_set: patch_set.to_string(),
            target: None,
            destination: None,
            rules: Vec::new(),
            success: false,
            committed: false,
            rolled_back: false,
            dry_run: false,
            original_checksum,
            checksum: original_checksum,
            length_delta: 0,
            failure: None,
        }
    }

    pub fn rule(&self, id: &str) -> Option<&RuleReport> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn applied(&self) -> usize {
        self.count(|s| matches!(s, RuleStatus::Applied))
    }

    pub fn already_applied(&self) -> usize {
        self.count(|s| matches!(s, RuleStatus::AlreadyApplied))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, RuleStatus::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| s.is_failure())
    }

    /// The buffer differs from the original.
    pub fn changed(&self) -> bool {
        self.success && (self.checksum != self.original_checksum || self.length_delta != 0)
    }

    fn count(&self, pred: impl Fn(&RuleStatus) -> bool) -> usize {
        self.rules.iter().filter(|r| pred(&r.status)).count()
    }
}

impl fmt::Display for ApplicationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "patch set '{}'", self.patch_set)?;
        if let Some(target) = &self.target {
            write!(f, " on {}", target.display())?;
        }
        writeln!(f, ":")?;
        for rule in &self.rules {
            writeln!(f, "  {rule}")?;
        }
        if self.success {
            write!(
                f,
                "ok: {} applied, {} already applied, checksum {} -> {}",
                self.applied(),
                self.already_applied(),
                self.original_checksum,
                self.checksum
            )?;
            if self.length_delta != 0 {
                write!(f, " ({:+} bytes)", self.length_delta)?;
            }
            if self.dry_run {
                write!(f, " [dry run]")?;
            }
        } else if let Some(failure) = &self.failure {
            write!(f, "failed: {}", failure.message)?;
            if self.rolled_back {
                write!(f, " (target restored)")?;
            }
        }
        Ok(())
    }
}
