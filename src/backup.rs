//! Pristine-copy backups for patched targets.
//!
//! Each target gets exactly one sidecar artifact next to it
//! (`<file name><suffix>`). The artifact is a small fixed header followed by
//! the original bytes:
//!
//! ```text
//! 0..8    magic  b"BPBAK\0\x01\0"
//! 8..16   xxh3-64 of payload, little endian
//! 16..24  creation time, seconds since the Unix epoch, little endian
//! 24..32  payload length, little endian
//! 32..    payload
//! ```
//!
//! Artifacts are written to a temp file and renamed into place, so a crash
//! mid-write leaves either no artifact or a complete one. An existing
//! artifact is never overwritten.

use crate::edit::atomic_write;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

const MAGIC: &[u8; 8] = b"BPBAK\x00\x01\x00";
const HEADER_LEN: usize = 32;

pub const DEFAULT_SUFFIX: &str = ".bpbak";

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("no backup exists for {target} (expected {backup})")]
    Missing { target: PathBuf, backup: PathBuf },

    #[error("backup {backup} is corrupt: {reason}")]
    Corrupt { backup: PathBuf, reason: String },

    #[error("backup I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Metadata of a verified backup artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub target: PathBuf,
    pub backup: PathBuf,
    /// xxh3-64 of the pristine bytes
    pub checksum: u64,
    /// Seconds since the Unix epoch
    pub created: u64,
    pub size: u64,
}

/// Outcome of [`BackupStore::ensure_backup`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum EnsureOutcome {
    Created(BackupRecord),
    Existing(BackupRecord),
}

impl EnsureOutcome {
    pub fn record(&self) -> &BackupRecord {
        match self {
            EnsureOutcome::Created(r) | EnsureOutcome::Existing(r) => r,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, EnsureOutcome::Created(_))
    }
}

/// Creates, verifies and restores sidecar backups.
#[derive(Debug, Clone)]
pub struct BackupStore {
    suffix: String,
}

impl Default for BackupStore {
    fn default() -> Self {
        Self::new(DEFAULT_SUFFIX)
    }
}

impl BackupStore {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Path of the backup artifact for `target`.
    pub fn backup_path(&self, target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(&self.suffix);
        target.with_file_name(name)
    }

    /// True iff a readable, checksum-consistent backup exists for `target`.
    pub fn has_backup(&self, target: &Path) -> bool {
        self.read(target).is_ok()
    }

    /// Verified metadata for `target`'s backup, or `None` if there is no valid one.
    pub fn inspect(&self, target: &Path) -> Option<BackupRecord> {
        self.read(target).ok().map(|(record, _)| record)
    }

    /// Snapshot `current` as the pristine copy unless a backup already exists.
    ///
    /// An existing artifact is never replaced. If it fails verification this
    /// returns [`BackupError::Corrupt`] rather than overwriting it.
    pub fn ensure_backup(&self, target: &Path, current: &[u8]) -> Result<EnsureOutcome, BackupError> {
        let backup = self.backup_path(target);

        match self.read(target) {
            Ok((record, _)) => {
                if record.size != current.len() as u64 {
                    log::warn!(
                        "existing backup {} holds {} bytes but {} is {} bytes; keeping it",
                        backup.display(),
                        record.size,
                        target.display(),
                        current.len()
                    );
                }
                return Ok(EnsureOutcome::Existing(record));
            }
            Err(BackupError::Missing { .. }) => {}
            Err(e) => return Err(e),
        }

        let checksum = xxh3_64(current);
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut artifact = Vec::with_capacity(HEADER_LEN + current.len());
        artifact.extend_from_slice(MAGIC);
        artifact.extend_from_slice(&checksum.to_le_bytes());
        artifact.extend_from_slice(&created.to_le_bytes());
        artifact.extend_from_slice(&(current.len() as u64).to_le_bytes());
        artifact.extend_from_slice(current);

        atomic_write(&backup, &artifact).map_err(|source| BackupError::Io {
            path: backup.clone(),
            source,
        })?;

        log::info!(
            "created backup {} ({} bytes, xxh3 {:016x})",
            backup.display(),
            current.len(),
            checksum
        );

        Ok(EnsureOutcome::Created(BackupRecord {
            target: target.to_path_buf(),
            backup,
            checksum,
            created,
            size: current.len() as u64,
        }))
    }

    /// Pristine bytes recorded for `target`.
    pub fn restore(&self, target: &Path) -> Result<Vec<u8>, BackupError> {
        self.read(target).map(|(_, payload)| payload)
    }

    /// Remove the artifact for `target`. Only called after a successful restore.
    pub(crate) fn discard(&self, target: &Path) -> Result<(), BackupError> {
        let backup = self.backup_path(target);
        fs::remove_file(&backup).map_err(|source| BackupError::Io {
            path: backup.clone(),
            source,
        })?;
        log::info!("discarded backup {}", backup.display());
        Ok(())
    }

    fn read(&self, target: &Path) -> Result<(BackupRecord, Vec<u8>), BackupError> {
        let backup = self.backup_path(target);

        let mut artifact = match fs::read(&backup) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackupError::Missing {
                    target: target.to_path_buf(),
                    backup,
                })
            }
            Err(source) => {
                return Err(BackupError::Io {
                    path: backup,
                    source,
                })
            }
        };

        let corrupt = |reason: String| BackupError::Corrupt {
            backup: backup.clone(),
            reason,
        };

        if artifact.len() < HEADER_LEN {
            return Err(corrupt(format!(
                "artifact is {} bytes, shorter than the {HEADER_LEN}-byte header",
                artifact.len()
            )));
        }
        if &artifact[..8] != MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }

        let field = |range: std::ops::Range<usize>| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&artifact[range]);
            u64::from_le_bytes(buf)
        };
        let checksum = field(8..16);
        let created = field(16..24);
        let size = field(24..32);

        let payload_len = (artifact.len() - HEADER_LEN) as u64;
        if payload_len != size {
            return Err(corrupt(format!(
                "header records {size} bytes but payload is {payload_len} bytes"
            )));
        }

        let payload = artifact.split_off(HEADER_LEN);
        let actual = xxh3_64(&payload);
        if actual != checksum {
            return Err(corrupt(format!(
                "checksum mismatch (recorded {checksum:016x}, actual {actual:016x})"
            )));
        }

        Ok((
            BackupRecord {
                target: target.to_path_buf(),
                backup,
                checksum,
                created,
                size,
            },
            payload,
        ))
    }
}
