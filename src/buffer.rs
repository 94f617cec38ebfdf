use crate::checksum::Checksum;
use std::io::Write;
use std::ops::Range;
use std::path::Path;

/// Mutable in-memory copy of a target file.
///
/// Owned by exactly one engine run and never written to disk until commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingBuffer {
    bytes: Vec<u8>,
}

impl WorkingBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, range: Range<usize>) -> Option<&[u8]> {
        self.bytes.get(range)
    }

    pub fn checksum(&self) -> Checksum {
        Checksum::of(&self.bytes)
    }

    /// Replace `len` bytes at `offset` with `replacement`.
    ///
    /// Callers validate the span first; see [`crate::edit::apply_batch`].
    pub(crate) fn splice(&mut self, offset: usize, len: usize, replacement: &[u8]) {
        if replacement.len() == len {
            self.bytes[offset..offset + len].copy_from_slice(replacement);
        } else {
            self.bytes
                .splice(offset..offset + len, replacement.iter().copied());
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

impl AsRef<[u8]> for WorkingBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Atomic file write: tempfile + fsync + rename.
///
/// Either the full content lands at `path` or `path` is left untouched.
pub fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    // Tempfile in the same directory so the rename stays on one filesystem
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        Some(_) => Path::new("."),
        None => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path has no parent directory",
            ))
        }
    };

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    // Keep the target's mode; tempfiles are created 0600
    if let Ok(metadata) = std::fs::metadata(path) {
        temp.as_file().set_permissions(metadata.permissions())?;
    }
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}
