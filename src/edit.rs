use crate::signature::Signature;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// The fundamental edit primitive: same-length byte-span overwrite with verification.
///
/// Every rule application compiles down to one of these. Edits never resize
/// the buffer, so no other offset in the file moves.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "ByteEdit does nothing until applied"]
pub struct ByteEdit {
    /// Rule that produced this edit
    pub rule_id: String,
    /// Starting byte offset (inclusive)
    pub offset: usize,
    /// Bytes written at [offset, offset + replacement.len())
    pub replacement: Vec<u8>,
    /// What we expect to find before overwriting
    pub expected_before: EditVerification,
}

/// Verification strategy for edit safety.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditVerification {
    /// Masked signature must match the span
    Signature(Signature),
    /// xxh3 hash of the expected span
    Hash(u64),
}

impl EditVerification {
    pub fn matches(&self, bytes: &[u8]) -> bool {
        match self {
            EditVerification::Signature(sig) => sig.len() == bytes.len() && sig.matches_at(bytes, 0),
            EditVerification::Hash(expected) => xxh3_64(bytes) == *expected,
        }
    }
}

#[derive(Error, Debug)]
pub enum EditError {
    #[error("before-bytes verification failed for rule '{rule_id}' at offset {offset:#x}")]
    BeforeBytesMismatch { rule_id: String, offset: usize },

    #[error("invalid byte range: [{start:#x}, {end:#x}) in buffer of length {len}")]
    InvalidByteRange { start: usize, end: usize, len: usize },

    #[error("rules '{first}' and '{second}' write overlapping ranges at offset {offset:#x}")]
    Overlap {
        first: String,
        second: String,
        offset: usize,
    },

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of applying an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "EditResult should be checked for applied/already-applied"]
pub enum EditResult {
    Applied { offset: usize, bytes_changed: usize },
    AlreadyApplied { offset: usize },
}

impl ByteEdit {
    pub fn new(
        rule_id: impl Into<String>,
        offset: usize,
        replacement: impl Into<Vec<u8>>,
        expected_before: EditVerification,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            offset,
            replacement: replacement.into(),
            expected_before,
        }
    }

    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.replacement.len())
    }

    /// Check the edit against `buffer` without modifying it.
    ///
    /// Returns the bytes currently occupying the span.
    fn validate<'a>(&self, buffer: &'a [u8]) -> Result<&'a [u8], EditError> {
        let current = self
            .offset
            .checked_add(self.replacement.len())
            .and_then(|end| buffer.get(self.offset..end))
            .ok_or(EditError::InvalidByteRange {
                start: self.offset,
                end: self.end(),
                len: buffer.len(),
            })?;

        if current == self.replacement.as_slice() {
            return Ok(current);
        }

        if !self.expected_before.matches(current) {
            return Err(EditError::BeforeBytesMismatch {
                rule_id: self.rule_id.clone(),
                offset: self.offset,
            });
        }

        Ok(current)
    }

    /// Overwrite the span in `buffer`. The buffer length never changes.
    pub fn apply_to(&self, buffer: &mut [u8]) -> Result<EditResult, EditError> {
        if self.validate(buffer)? == self.replacement.as_slice() {
            return Ok(EditResult::AlreadyApplied {
                offset: self.offset,
            });
        }

        buffer[self.offset..self.end()].copy_from_slice(&self.replacement);

        Ok(EditResult::Applied {
            offset: self.offset,
            bytes_changed: self.replacement.len(),
        })
    }

    /// Apply several edits to one buffer, all or nothing.
    ///
    /// Every edit is validated and checked for overlap before the first
    /// byte is written.
    pub fn apply_batch(mut edits: Vec<ByteEdit>, buffer: &mut [u8]) -> Result<Vec<EditResult>, EditError> {
        edits.sort_by_key(|e| e.offset);

        for edit in &edits {
            edit.validate(buffer)?;
        }

        for window in edits.windows(2) {
            let (earlier, later) = (&window[0], &window[1]);
            if earlier.end() > later.offset {
                return Err(EditError::Overlap {
                    first: earlier.rule_id.clone(),
                    second: later.rule_id.clone(),
                    offset: later.offset,
                });
            }
        }

        edits.iter().map(|edit| edit.apply_to(buffer)).collect()
    }
}

/// Atomic file write: tempfile + fsync + rename.
///
/// The temp file is created next to `path` so the rename stays on one
/// filesystem, and it takes over the permissions of the file it replaces.
/// Either the whole write lands or `path` keeps its previous content.
pub fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path has no parent directory",
        )
    })?;
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .tempfile_in(parent)?;

    temp.write_all(content)?;
    temp.as_file().sync_all()?;

    if let Ok(metadata) = fs::metadata(path) {
        temp.as_file().set_permissions(metadata.permissions())?;
    }

    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}
