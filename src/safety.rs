use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("target is not a regular file: {path}")]
    NotRegularFile { path: PathBuf },

    #[error("target is locked by another process: {path}")]
    Locked { path: PathBuf },

    #[error("another operation is already in progress for {path}")]
    Busy { path: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },
}

/// True if `error` means another process holds the file open exclusively.
///
/// Windows reports sharing and lock violations; on Unix, opening a running
/// executable for writing fails with `ETXTBSY`.
pub fn is_lock_error(error: &io::Error) -> bool {
    #[cfg(windows)]
    {
        const ERROR_SHARING_VIOLATION: i32 = 32;
        const ERROR_LOCK_VIOLATION: i32 = 33;
        matches!(
            error.raw_os_error(),
            Some(ERROR_SHARING_VIOLATION) | Some(ERROR_LOCK_VIOLATION)
        )
    }
    #[cfg(unix)]
    {
        error.raw_os_error() == Some(libc::ETXTBSY)
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = error;
        false
    }
}

pub(crate) fn io_error(path: &Path, source: io::Error) -> SafetyError {
    if is_lock_error(&source) {
        SafetyError::Locked {
            path: path.to_path_buf(),
        }
    } else {
        SafetyError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Canonicalize `path` and check that it names a regular file.
pub fn validate_target(path: impl AsRef<Path>) -> Result<PathBuf, SafetyError> {
    let path = path.as_ref();
    let canonical = path.canonicalize().map_err(|source| io_error(path, source))?;
    let metadata = fs::metadata(&canonical).map_err(|source| io_error(&canonical, source))?;
    if !metadata.is_file() {
        return Err(SafetyError::NotRegularFile { path: canonical });
    }
    Ok(canonical)
}

/// Read the whole target through a read+write handle.
///
/// Opening for write is what surfaces a lock held by a running browser, so a
/// target we could read but never replace is rejected up front.
pub fn read_target(path: &Path) -> Result<Vec<u8>, SafetyError> {
    let mut file: File = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| io_error(path, source))?;

    let capacity = file
        .metadata()
        .map(|m| m.len() as usize)
        .unwrap_or_default();
    let mut buffer = Vec::with_capacity(capacity);
    file.read_to_end(&mut buffer)
        .map_err(|source| io_error(path, source))?;

    Ok(buffer)
}

/// Fail with [`SafetyError::Locked`] if `path` cannot currently be opened for writing.
pub fn check_writable(path: &Path) -> Result<(), SafetyError> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .map(drop)
        .map_err(|source| io_error(path, source))
}

fn in_flight() -> &'static Mutex<HashSet<PathBuf>> {
    static IN_FLIGHT: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    IN_FLIGHT.get_or_init(|| Mutex::new(HashSet::new()))
}

fn registry() -> MutexGuard<'static, HashSet<PathBuf>> {
    in_flight()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Claim on a target path for the duration of one operation.
///
/// At most one guard exists per canonical path in the process; dropping the
/// guard releases the claim.
#[derive(Debug)]
#[must_use = "the claim is released as soon as the guard is dropped"]
pub struct TargetGuard {
    path: PathBuf,
}

impl TargetGuard {
    /// Claim `path` (already canonical). Fails with [`SafetyError::Busy`] if claimed.
    pub fn acquire(path: &Path) -> Result<Self, SafetyError> {
        let mut set = registry();
        if !set.insert(path.to_path_buf()) {
            return Err(SafetyError::Busy {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        registry().remove(&self.path);
    }
}
