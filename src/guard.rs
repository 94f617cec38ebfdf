//! Snapshots, backups and rollback around a patch run.
//!
//! Before the first byte of a target changes, the guard persists an exact
//! copy next to it (`<target>.bak`, original mtime kept) plus a JSON sidecar
//! (`<target>.bak.json`) recording the original checksum. After commit the
//! sidecar also records the patched checksum and the applied set, which is
//! how a second run of the same set is recognised as
//! [`PatchError::AlreadyPatched`]. Further sets stack on top and the backup
//! keeps holding the untouched original.

use crate::buffer::{atomic_write, WorkingBuffer};
use crate::checksum::Checksum;
use crate::error::PatchError;
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_BACKUP_SUFFIX: &str = "bak";

/// Contents of the backup sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub original_checksum: Checksum,
    pub original_len: u64,
    /// Checksum of the file as last committed by this tool.
    #[serde(default)]
    pub patched_checksum: Option<Checksum>,
    /// Sets applied on top of the original, in order.
    #[serde(default)]
    pub patch_sets: Vec<String>,
}

impl BackupRecord {
    fn pristine(checksum: Checksum, len: usize) -> Self {
        Self {
            original_checksum: checksum,
            original_len: len as u64,
            patched_checksum: None,
            patch_sets: Vec::new(),
        }
    }
}

/// The original content of one target, held for the duration of one run.
///
/// Not `Clone`. Ends in [`IntegrityGuard::rollback`] or
/// [`IntegrityGuard::discard`], or is dropped after a commit.
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
    bytes: Vec<u8>,
    checksum: Checksum,
    mtime: FileTime,
    backup: Option<PathBuf>,
    /// Sidecar contents when the snapshot was taken.
    record: Option<BackupRecord>,
    created_backup: bool,
}

impl Snapshot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Persisted backup, if this snapshot wrote or reused one.
    pub fn backup(&self) -> Option<&Path> {
        self.backup.as_deref()
    }

    /// Fresh working copy of the original bytes.
    pub fn working_buffer(&self) -> WorkingBuffer {
        WorkingBuffer::from_slice(&self.bytes)
    }
}

/// Expected properties of a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invariants {
    pub checksum: Option<Checksum>,
    pub len: Option<usize>,
    /// `(offset, expected bytes)` pairs.
    pub regions: Vec<(usize, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Checksum { expected: Checksum, found: Checksum },
    Length { expected: usize, found: usize },
    /// `found` is shorter than expected when the region runs past the end.
    Region { offset: usize, expected: Vec<u8>, found: Vec<u8> },
}

impl Invariants {
    pub fn with_region(mut self, offset: usize, expected: impl Into<Vec<u8>>) -> Self {
        self.regions.push((offset, expected.into()));
        self
    }

    pub fn first_violation(&self, buffer: &[u8]) -> Option<Violation> {
        if let Some(expected) = self.len {
            if buffer.len() != expected {
                return Some(Violation::Length {
                    expected,
                    found: buffer.len(),
                });
            }
        }
        if let Some(expected) = self.checksum {
            let found = Checksum::of(buffer);
            if found != expected {
                return Some(Violation::Checksum { expected, found });
            }
        }
        self.regions.iter().find_map(|(offset, expected)| {
            let start = (*offset).min(buffer.len());
            let end = offset.saturating_add(expected.len()).min(buffer.len());
            let found = &buffer[start..end];
            (found != expected.as_slice()).then(|| Violation::Region {
                offset: *offset,
                expected: expected.clone(),
                found: found.to_vec(),
            })
        })
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityGuard {
    suffix: String,
}

impl Default for IntegrityGuard {
    fn default() -> Self {
        Self::new(DEFAULT_BACKUP_SUFFIX)
    }
}

impl IntegrityGuard {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// `<target>.<suffix>`
    pub fn backup_path(&self, target: &Path) -> PathBuf {
        let mut name = target.as_os_str().to_os_string();
        name.push(".");
        name.push(&self.suffix);
        PathBuf::from(name)
    }

    /// `<target>.<suffix>.json`
    pub fn record_path(&self, target: &Path) -> PathBuf {
        let mut name = self.backup_path(target).into_os_string();
        name.push(".json");
        PathBuf::from(name)
    }

    pub fn read_record(&self, target: &Path) -> Result<Option<BackupRecord>, PatchError> {
        let path = self.record_path(target);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PatchError::io(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| PatchError::io(&path, e.into()))
    }

    fn write_record(&self, target: &Path, record: &BackupRecord) -> Result<(), PatchError> {
        let path = self.record_path(target);
        let json = serde_json::to_vec_pretty(record).map_err(|e| PatchError::io(&path, e.into()))?;
        atomic_write(&path, &json).map_err(|e| PatchError::io(&path, e))
    }

    /// Read `path` into memory without persisting anything.
    ///
    /// Used for dry runs and when the patched output goes to a different file.
    pub fn capture(&self, path: &Path) -> Result<Snapshot, PatchError> {
        let metadata = fs::metadata(path).map_err(|e| PatchError::io(path, e))?;
        let bytes = fs::read(path).map_err(|e| PatchError::io(path, e))?;
        Ok(Snapshot {
            path: path.to_path_buf(),
            checksum: Checksum::of(&bytes),
            bytes,
            mtime: FileTime::from_last_modification_time(&metadata),
            backup: None,
            record: None,
            created_backup: false,
        })
    }

    /// Capture `path` and persist its backup before any write.
    ///
    /// Refuses a file this tool already committed and has not seen change
    /// since.
    pub fn snapshot(&self, path: &Path) -> Result<Snapshot, PatchError> {
        self.snapshot_inner(path, None)
    }

    /// Like [`IntegrityGuard::snapshot`], but a file already patched by other
    /// sets is accepted so sets can be stacked. The backup keeps holding the
    /// untouched original.
    pub fn snapshot_for_set(&self, path: &Path, patch_set: &str) -> Result<Snapshot, PatchError> {
        self.snapshot_inner(path, Some(patch_set))
    }

    fn snapshot_inner(&self, path: &Path, patch_set: Option<&str>) -> Result<Snapshot, PatchError> {
        let mut snapshot = self.capture(path)?;
        let backup = self.backup_path(path);
        let existing = self.read_record(path)?;

        let stacked = existing
            .as_ref()
            .filter(|r| r.patched_checksum == Some(snapshot.checksum));
        if let Some(record) = stacked {
            let refused = match patch_set {
                None => true,
                Some(name) => record.patch_sets.iter().any(|s| s == name),
            };
            if refused {
                return Err(PatchError::AlreadyPatched {
                    path: path.to_path_buf(),
                    checksum: snapshot.checksum,
                });
            }
            // Never re-baseline a file the record marks as patched.
            let found = fs::read(&backup)
                .map(|bytes| Checksum::of(&bytes))
                .unwrap_or_else(|_| Checksum::of(&[]));
            if found != record.original_checksum {
                return Err(PatchError::BackupCorrupt {
                    path: backup,
                    expected: record.original_checksum,
                    found,
                });
            }
            snapshot.record = Some(record.clone());
            snapshot.backup = Some(backup);
            return Ok(snapshot);
        }

        let reusable = existing
            .as_ref()
            .filter(|r| r.original_checksum == snapshot.checksum && r.patched_checksum.is_none())
            .filter(|_| backup_matches(&backup, snapshot.checksum));

        let record = match reusable {
            Some(record) => record.clone(),
            None => {
                atomic_write(&backup, &snapshot.bytes).map_err(|e| PatchError::io(&backup, e))?;
                filetime::set_file_mtime(&backup, snapshot.mtime)
                    .map_err(|e| PatchError::io(&backup, e))?;
                let record = BackupRecord::pristine(snapshot.checksum, snapshot.len());
                self.write_record(path, &record)?;
                snapshot.created_backup = true;
                record
            }
        };

        snapshot.record = Some(record);
        snapshot.backup = Some(backup);
        Ok(snapshot)
    }

    pub fn verify(&self, buffer: &[u8], invariants: &Invariants) -> bool {
        invariants.first_violation(buffer).is_none()
    }

    /// The file at the snapshot's path still holds the original bytes.
    pub fn confirm_untouched(&self, snapshot: &Snapshot) -> Result<bool, PatchError> {
        let current = fs::read(&snapshot.path).map_err(|e| PatchError::io(&snapshot.path, e))?;
        Ok(current.len() == snapshot.len() && Checksum::of(&current) == snapshot.checksum)
    }

    /// Atomically write `buffer` to `dest` and read it back.
    ///
    /// When `dest` is the snapshot's own file the sidecar records the patched
    /// checksum and appends `patch_set`.
    pub fn commit(
        &self,
        snapshot: &Snapshot,
        buffer: &WorkingBuffer,
        dest: &Path,
        patch_set: &str,
    ) -> Result<Checksum, PatchError> {
        let expected = buffer.checksum();
        atomic_write(dest, buffer.as_slice()).map_err(|e| PatchError::io(dest, e))?;

        let written = fs::read(dest).map_err(|e| PatchError::io(dest, e))?;
        let found = Checksum::of(&written);
        if found != expected {
            return Err(PatchError::CommitVerification {
                path: dest.to_path_buf(),
                expected,
                found,
            });
        }

        if let Some(record) = &snapshot.record {
            if same_file(dest, &snapshot.path) {
                let mut record = record.clone();
                record.patched_checksum = Some(found);
                record.patch_sets.push(patch_set.to_string());
                self.write_record(&snapshot.path, &record)?;
            }
        }

        Ok(found)
    }

    /// Put the snapshot's bytes back at its path and verify them.
    ///
    /// The sidecar returns to its state at snapshot time.
    pub fn rollback(&self, snapshot: Snapshot) -> Result<(), PatchError> {
        let fail = |reason: String| PatchError::RollbackFailed {
            path: snapshot.path.clone(),
            backup: snapshot.backup.clone(),
            reason,
        };

        atomic_write(&snapshot.path, &snapshot.bytes).map_err(|e| fail(e.to_string()))?;
        let restored = fs::read(&snapshot.path).map_err(|e| fail(e.to_string()))?;
        let found = Checksum::of(&restored);
        if found != snapshot.checksum {
            return Err(fail(format!(
                "restored checksum {found} does not match original {}",
                snapshot.checksum
            )));
        }
        filetime::set_file_mtime(&snapshot.path, snapshot.mtime)
            .map_err(|e| fail(e.to_string()))?;

        if let Some(record) = &snapshot.record {
            self.write_record(&snapshot.path, record)
                .map_err(|e| fail(e.to_string()))?;
        }
        Ok(())
    }

    /// Drop a snapshot whose target was never written.
    ///
    /// A backup created by this snapshot is removed again.
    pub fn discard(&self, snapshot: Snapshot) -> Result<(), PatchError> {
        if !snapshot.created_backup {
            return Ok(());
        }
        if let Some(backup) = &snapshot.backup {
            remove_if_exists(backup)?;
            remove_if_exists(&self.record_path(&snapshot.path))?;
        }
        Ok(())
    }

    /// Restore `target` from its persisted backup and remove the backup.
    ///
    /// Returns the checksum of the restored file.
    pub fn restore(&self, target: &Path) -> Result<Checksum, PatchError> {
        let record_path = self.record_path(target);
        let record = self.read_record(target)?.ok_or_else(|| {
            PatchError::io(
                &record_path,
                io::Error::new(io::ErrorKind::NotFound, "no backup record"),
            )
        })?;

        let backup = self.backup_path(target);
        let metadata = fs::metadata(&backup).map_err(|e| PatchError::io(&backup, e))?;
        let bytes = fs::read(&backup).map_err(|e| PatchError::io(&backup, e))?;
        let found = Checksum::of(&bytes);
        if found != record.original_checksum || bytes.len() as u64 != record.original_len {
            return Err(PatchError::BackupCorrupt {
                path: backup,
                expected: record.original_checksum,
                found,
            });
        }

        atomic_write(target, &bytes).map_err(|e| PatchError::io(target, e))?;
        filetime::set_file_mtime(target, FileTime::from_last_modification_time(&metadata))
            .map_err(|e| PatchError::io(target, e))?;

        remove_if_exists(&backup)?;
        remove_if_exists(&record_path)?;
        Ok(found)
    }
}

fn backup_matches(backup: &Path, checksum: Checksum) -> bool {
    fs::read(backup)
        .map(|bytes| Checksum::of(&bytes) == checksum)
        .unwrap_or(false)
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn remove_if_exists(path: &Path) -> Result<(), PatchError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PatchError::io(path, e)),
    }
}
