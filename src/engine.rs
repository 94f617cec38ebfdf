//! Applies a [`PatchSet`] to a buffer or a file as one all-or-nothing unit.
//!
//! Rules run in order against a single [`WorkingBuffer`], so every rule
//! sees the bytes written by the rules before it. Post-conditions are
//! checked once all rules have run. Nothing reaches disk unless every rule
//! and every post-condition succeeded.

use crate::buffer::WorkingBuffer;
use crate::checksum::Checksum;
use crate::config::version::{parse_build, VersionError};
use crate::edit::{apply_batch, ByteEdit, EditError, EditResult};
use crate::error::PatchError;
use crate::guard::{IntegrityGuard, Invariants, Snapshot, Violation, DEFAULT_BACKUP_SUFFIX};
use crate::matcher::PatternMatcher;
use crate::patch::{Occurrence, PatchRule, PatchSet, Replacement, RequiredCount};
use crate::report::{ApplicationReport, Failure, RuleReport, RuleStatus};
use crate::signature::Signature;
use semver::Version;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Refuse every rule whose replacement changes the region length.
    pub safe_mode: bool,
    /// Build of the client being patched; sets whose `build_range`
    /// excludes it are not applied.
    pub client_build: Option<String>,
    pub backup_suffix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            safe_mode: true,
            client_build: None,
            backup_suffix: DEFAULT_BACKUP_SUFFIX.to_string(),
        }
    }
}

/// Shared flag checked before each rule and before commit.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One file-level apply.
#[derive(Debug, Clone, Copy)]
pub struct ApplyRequest<'a> {
    pub target: &'a Path,
    /// Write the patched bytes here instead of over `target`.
    pub destination: Option<&'a Path>,
    pub dry_run: bool,
    pub cancel: Option<&'a CancelToken>,
}

impl<'a> ApplyRequest<'a> {
    pub fn new(target: &'a Path) -> Self {
        Self {
            target,
            destination: None,
            dry_run: false,
            cancel: None,
        }
    }

    pub fn output(mut self, destination: &'a Path) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn cancel_token(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn in_place(&self) -> bool {
        self.destination.map_or(true, |dest| dest == self.target)
    }
}

/// Result of resolving and writing one rule.
struct RuleOutcome {
    status: RuleStatus,
    /// Final offsets of the sites, ascending.
    offsets: Vec<usize>,
    /// `(offset, len, delta)` of every resizing write, in pre-rule coordinates.
    resized: Vec<(usize, usize, i64)>,
}

#[derive(Debug, Clone)]
pub struct PatchEngine {
    config: EngineConfig,
    build: Option<Version>,
    guard: IntegrityGuard,
}

impl PatchEngine {
    pub fn new(config: EngineConfig) -> Result<Self, VersionError> {
        let build = config.client_build.as_deref().map(parse_build).transpose()?;
        let guard = IntegrityGuard::new(config.backup_suffix.clone());
        Ok(Self {
            config,
            build,
            guard,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn guard(&self) -> &IntegrityGuard {
        &self.guard
    }

    /// Run the whole pipeline in memory and report what would happen.
    pub fn check(&self, set: &PatchSet, bytes: &[u8]) -> ApplicationReport {
        let mut buffer = WorkingBuffer::from_slice(bytes);
        let mut report = self.apply(set, &mut buffer, None);
        report.dry_run = true;
        report
    }

    /// Apply `set` to `buffer` in memory.
    ///
    /// On failure `buffer` is left holding its original bytes.
    pub fn apply(
        &self,
        set: &PatchSet,
        buffer: &mut WorkingBuffer,
        cancel: Option<&CancelToken>,
    ) -> ApplicationReport {
        let original = buffer.clone();
        let mut report = ApplicationReport::new(set.name(), original.checksum());
        if let Err(error) = self.run(set, buffer, cancel, &mut report) {
            *buffer = original;
            fail(&mut report, &error);
        }
        report
    }

    /// Apply `set` to a file.
    ///
    /// In-place applies persist a backup first and restore the target if
    /// anything goes wrong after it was written.
    pub fn apply_file(&self, set: &PatchSet, request: &ApplyRequest<'_>) -> ApplicationReport {
        let dest = request.destination.unwrap_or(request.target);
        let persist = request.in_place() && !request.dry_run && self.build_exclusion(set).is_none();

        let snapshot = if persist {
            self.guard.snapshot_for_set(request.target, set.name())
        } else {
            self.guard.capture(request.target)
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(error) => {
                let checksum = match &error {
                    PatchError::AlreadyPatched { checksum, .. } => *checksum,
                    _ => Checksum::of(&[]),
                };
                let mut report = ApplicationReport::new(set.name(), checksum);
                report.target = Some(request.target.to_path_buf());
                report.destination = Some(dest.to_path_buf());
                report.dry_run = request.dry_run;
                report.rules = skipped_rules(set, &error.to_string());
                fail(&mut report, &error);
                return report;
            }
        };

        let mut report = ApplicationReport::new(set.name(), snapshot.checksum());
        report.target = Some(request.target.to_path_buf());
        report.destination = Some(dest.to_path_buf());
        report.dry_run = request.dry_run;

        let mut buffer = snapshot.working_buffer();
        if let Err(error) = self.run(set, &mut buffer, request.cancel, &mut report) {
            let error = self.abandon(snapshot, &mut report).unwrap_or(error);
            fail(&mut report, &error);
            return report;
        }

        if request.dry_run || (request.in_place() && !report.changed()) {
            if let Err(error) = self.guard.discard(snapshot) {
                fail(&mut report, &error);
            }
            return report;
        }

        if request.cancel.is_some_and(CancelToken::is_cancelled) {
            match self.guard.discard(snapshot) {
                Ok(()) => fail(&mut report, &PatchError::Cancelled),
                Err(error) => fail(&mut report, &error),
            }
            return report;
        }

        match self.guard.commit(&snapshot, &buffer, dest, set.name()) {
            Ok(_) => report.committed = true,
            Err(error) => {
                let error = if request.in_place() {
                    match self.guard.rollback(snapshot) {
                        Ok(()) => {
                            report.rolled_back = true;
                            error
                        }
                        Err(critical) => critical,
                    }
                } else {
                    error
                };
                fail(&mut report, &error);
            }
        }
        report
    }

    /// Release a snapshot after a failed run, restoring the target if it
    /// no longer holds its original bytes. Returns an escalated error if
    /// the restore itself failed.
    fn abandon(&self, snapshot: Snapshot, report: &mut ApplicationReport) -> Option<PatchError> {
        if snapshot.backup().is_none() {
            return None;
        }
        match self.guard.confirm_untouched(&snapshot) {
            Ok(true) => self.guard.discard(snapshot).err(),
            Ok(false) | Err(_) => match self.guard.rollback(snapshot) {
                Ok(()) => {
                    report.rolled_back = true;
                    None
                }
                Err(critical) => Some(critical),
            },
        }
    }

    fn build_exclusion(&self, set: &PatchSet) -> Option<PatchError> {
        let build = self.build.as_ref()?;
        let range = set.meta.build_range.as_ref()?;
        (!range.matches(build)).then(|| PatchError::BuildExcluded {
            set: set.name().to_string(),
            build: build.to_string(),
            range: range.to_string(),
        })
    }

    fn run(
        &self,
        set: &PatchSet,
        buffer: &mut WorkingBuffer,
        cancel: Option<&CancelToken>,
        report: &mut ApplicationReport,
    ) -> Result<(), PatchError> {
        report.rules = skipped_rules(set, "not reached");

        if let Some(error) = self.build_exclusion(set) {
            report.rules = skipped_rules(set, &error.to_string());
            return Err(error);
        }

        let original_len = buffer.len();
        for (idx, rule) in set.rules.iter().enumerate() {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                for skipped in &mut report.rules[idx..] {
                    skipped.status = RuleStatus::Skipped {
                        reason: "cancelled".to_string(),
                    };
                }
                return Err(PatchError::Cancelled);
            }

            let outcome = match self.apply_rule(rule, buffer) {
                Ok(outcome) => outcome,
                Err(error) => {
                    report.rules[idx].status = RuleStatus::Failed {
                        reason: error.to_string(),
                    };
                    return Err(error);
                }
            };

            if !outcome.resized.is_empty() {
                for earlier in &mut report.rules[..idx] {
                    for offset in &mut earlier.offsets {
                        *offset = shift(*offset, &outcome.resized);
                    }
                }
            }
            report.rules[idx].status = outcome.status;
            report.rules[idx].offsets = outcome.offsets;
        }

        for (idx, rule) in set.rules.iter().enumerate() {
            let first_write = report.rules[idx].offsets.first().copied();
            if let Err(error) = verify_rule(rule, first_write, buffer.as_slice()) {
                report.rules[idx].status = RuleStatus::Failed {
                    reason: error.to_string(),
                };
                return Err(error);
            }
        }

        report.checksum = buffer.checksum();
        report.length_delta = buffer.len() as i64 - original_len as i64;
        report.success = true;
        Ok(())
    }

    fn apply_rule(
        &self,
        rule: &PatchRule,
        buffer: &mut WorkingBuffer,
    ) -> Result<RuleOutcome, PatchError> {
        let matches = PatternMatcher::new(buffer.as_slice()).find_all(&rule.signature);

        if !rule.required_count.is_satisfied(matches.len()) {
            if matches.is_empty() {
                if let Some(offsets) = already_applied_sites(rule, buffer.as_slice()) {
                    return Ok(RuleOutcome {
                        status: RuleStatus::AlreadyApplied,
                        offsets,
                        resized: Vec::new(),
                    });
                }
            }
            return Err(PatchError::PatternMismatch {
                rule: rule.id.clone(),
                expected: rule.required_count,
                actual: matches.len(),
            });
        }

        let actual = matches.len();
        let sites = select(rule.occurrence, matches).ok_or_else(|| {
            let expected = match rule.occurrence {
                Occurrence::Nth(k) => RequiredCount::AtLeast(k + 1),
                _ => RequiredCount::AtLeast(1),
            };
            PatchError::PatternMismatch {
                rule: rule.id.clone(),
                expected,
                actual,
            }
        })?;

        let region_len = rule.region_len();
        let mut edits = Vec::with_capacity(sites.len());
        for site in sites {
            let start = i64::try_from(site)
                .ok()
                .and_then(|site| site.checked_add(rule.offset_adjustment));
            let out_of_bounds = || PatchError::OutOfBounds {
                rule: rule.id.clone(),
                start: start.unwrap_or(i64::MAX),
                len: region_len,
                buffer_len: buffer.len(),
            };
            let offset = start
                .and_then(|start| usize::try_from(start).ok())
                .ok_or_else(out_of_bounds)?;
            let region = offset
                .checked_add(region_len)
                .and_then(|end| buffer.get(offset..end))
                .ok_or_else(out_of_bounds)?;

            let replacement_len = match &rule.replacement {
                Replacement::Bytes(bytes) => bytes.len(),
                Replacement::Transform(transform) => transform.output_len(region_len),
            };
            if replacement_len != region_len && (self.config.safe_mode || !rule.resize_allowed) {
                return Err(PatchError::UnsafeResize {
                    rule: rule.id.clone(),
                    offset,
                    region_len,
                    replacement_len,
                    safe_mode: self.config.safe_mode,
                });
            }

            let replacement = match &rule.replacement {
                Replacement::Bytes(bytes) => bytes.clone(),
                Replacement::Transform(transform) => {
                    transform
                        .apply(region)
                        .map_err(|source| PatchError::Transform {
                            rule: rule.id.clone(),
                            source,
                        })?
                }
            };

            edits.push(ByteEdit::new(offset, region, replacement));
        }

        let mut plan: Vec<(usize, usize, i64)> = edits
            .iter()
            .map(|edit| (edit.offset, edit.len, edit.delta()))
            .collect();
        plan.sort_by_key(|(offset, _, _)| *offset);

        let results = apply_batch(buffer, edits).map_err(|source| edit_error(rule, source))?;

        let mut cumulative = 0i64;
        let mut offsets = Vec::with_capacity(results.len());
        for ((_, _, delta), result) in plan.iter().zip(&results) {
            let offset = match result {
                EditResult::Applied { offset, .. } | EditResult::AlreadyApplied { offset } => *offset,
            };
            offsets.push((offset as i64 + cumulative) as usize);
            if matches!(result, EditResult::Applied { .. }) {
                cumulative += delta;
            }
        }

        let status = if results
            .iter()
            .all(|r| matches!(r, EditResult::AlreadyApplied { .. }))
        {
            RuleStatus::AlreadyApplied
        } else {
            RuleStatus::Applied
        };

        Ok(RuleOutcome {
            status,
            offsets,
            resized: plan.into_iter().filter(|(_, _, delta)| *delta != 0).collect(),
        })
    }
}

fn fail(report: &mut ApplicationReport, error: &PatchError) {
    report.success = false;
    report.committed = false;
    report.checksum = report.original_checksum;
    report.length_delta = 0;
    report.failure = Some(Failure::from(error));
}

fn skipped_rules(set: &PatchSet, reason: &str) -> Vec<RuleReport> {
    set.rules
        .iter()
        .map(|rule| RuleReport {
            id: rule.id.clone(),
            status: RuleStatus::Skipped {
                reason: reason.to_string(),
            },
            offsets: Vec::new(),
        })
        .collect()
}

fn select(occurrence: Occurrence, mut matches: Vec<usize>) -> Option<Vec<usize>> {
    match occurrence {
        Occurrence::First => matches.first().map(|m| vec![*m]),
        Occurrence::All => Some(matches),
        Occurrence::Nth(k) => (k < matches.len()).then(|| vec![matches.swap_remove(k)]),
    }
}

/// Sites that already hold a literal replacement, if the post-patch bytes
/// satisfy the rule's count where the signature no longer does.
fn already_applied_sites(rule: &PatchRule, buffer: &[u8]) -> Option<Vec<usize>> {
    let Replacement::Bytes(bytes) = &rule.replacement else {
        return None;
    };
    if rule.offset_adjustment != 0 || bytes.len() != rule.region_len() {
        return None;
    }
    let patched = Signature::from_bytes(bytes).ok()?;
    if patched == rule.signature {
        return None;
    }
    let sites = PatternMatcher::new(buffer).find_all(&patched);
    if sites.is_empty() || !rule.required_count.is_satisfied(sites.len()) {
        return None;
    }
    select(rule.occurrence, sites)
}

/// Position of `offset` after the given earlier-coordinate writes.
fn shift(offset: usize, resized: &[(usize, usize, i64)]) -> usize {
    let delta: i64 = resized
        .iter()
        .filter(|(start, len, _)| start + len <= offset)
        .map(|(_, _, delta)| delta)
        .sum();
    (offset as i64 + delta) as usize
}

fn edit_error(rule: &PatchRule, source: EditError) -> PatchError {
    match source {
        EditError::InvalidByteRange {
            start,
            end,
            buffer_len,
        } => PatchError::OutOfBounds {
            rule: rule.id.clone(),
            start: start as i64,
            len: end.saturating_sub(start),
            buffer_len,
        },
        EditError::Overlapping {
            first_start,
            second_start,
            ..
        } => PatchError::OverlappingWrites {
            rule: rule.id.clone(),
            first: first_start,
            second: second_start,
        },
        source => PatchError::Edit {
            rule: rule.id.clone(),
            source,
        },
    }
}

fn verify_rule(rule: &PatchRule, first_write: Option<usize>, buffer: &[u8]) -> Result<(), PatchError> {
    for condition in &rule.post_conditions {
        let failed = |offset: usize, found: &[u8]| PatchError::PostConditionFailed {
            rule: rule.id.clone(),
            offset,
            expected: hex(&condition.expected),
            found: hex(found),
        };

        let Some(offset) = condition.resolve(first_write) else {
            return Err(failed(0, &[]));
        };
        let invariants = Invariants::default().with_region(offset, condition.expected.clone());
        if let Some(Violation::Region { found, .. }) = invariants.first_violation(buffer) {
            return Err(failed(offset, &found));
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "nothing".to_string();
    }
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
