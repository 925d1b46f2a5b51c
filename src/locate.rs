//! Target discovery.
//!
//! The engine accepts any path; finding the browser's module on disk is a
//! pluggable concern. [`DirectoryScan`] walks an install directory for a file
//! name. OS-specific probing (registry, default install folders) belongs in
//! other [`TargetLocator`] implementations.

use std::path::PathBuf;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("no '{file_name}' found under {root}")]
    NotFound { root: PathBuf, file_name: String },

    #[error("failed to scan {root}: {source}")]
    Walk {
        root: PathBuf,
        source: walkdir::Error,
    },
}

/// Finds the file to patch.
pub trait TargetLocator {
    fn locate(&self) -> Result<PathBuf, LocateError>;
}

/// A path supplied directly by the caller.
#[derive(Debug, Clone)]
pub struct FixedPath(pub PathBuf);

impl TargetLocator for FixedPath {
    fn locate(&self) -> Result<PathBuf, LocateError> {
        Ok(self.0.clone())
    }
}

/// Recursive search of `root` for files named `file_name`.
///
/// Several hits are tolerated: a warning is logged and the last one in path
/// order wins.
#[derive(Debug, Clone)]
pub struct DirectoryScan {
    pub root: PathBuf,
    pub file_name: String,
}

impl DirectoryScan {
    pub fn new(root: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            file_name: file_name.into(),
        }
    }

    /// Every matching file under `root`, sorted.
    pub fn candidates(&self) -> Result<Vec<PathBuf>, LocateError> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|source| LocateError::Walk {
                root: self.root.clone(),
                source,
            })?;
            if entry.file_type().is_file() && entry.file_name() == self.file_name.as_str() {
                found.push(entry.into_path());
            }
        }
        found.sort();
        Ok(found)
    }
}

impl TargetLocator for DirectoryScan {
    fn locate(&self) -> Result<PathBuf, LocateError> {
        let mut candidates = self.candidates()?;
        if candidates.len() > 1 {
            log::warn!(
                "found {} copies of {} under {}; using the last one",
                candidates.len(),
                self.file_name,
                self.root.display()
            );
        }
        candidates.pop().ok_or_else(|| LocateError::NotFound {
            root: self.root.clone(),
            file_name: self.file_name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_single_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("1.60.118");
        fs::create_dir_all(&version_dir).unwrap();
        fs::write(version_dir.join("chrome.dll"), b"MZ").unwrap();
        fs::write(dir.path().join("brave.exe"), b"MZ").unwrap();

        let found = DirectoryScan::new(dir.path(), "chrome.dll").locate().unwrap();
        assert_eq!(found, version_dir.join("chrome.dll"));
    }

    #[test]
    fn test_multiple_candidates_takes_last() {
        let dir = tempfile::tempdir().unwrap();
        for version in ["1.59.0", "1.60.0"] {
            let version_dir = dir.path().join(version);
            fs::create_dir_all(&version_dir).unwrap();
            fs::write(version_dir.join("chrome.dll"), b"MZ").unwrap();
        }

        let scan = DirectoryScan::new(dir.path(), "chrome.dll");
        assert_eq!(scan.candidates().unwrap().len(), 2);
        assert_eq!(
            scan.locate().unwrap(),
            dir.path().join("1.60.0").join("chrome.dll")
        );
    }

    #[test]
    fn test_no_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectoryScan::new(dir.path(), "chrome.dll").locate().unwrap_err();
        assert!(matches!(err, LocateError::NotFound { .. }));
    }

    #[test]
    fn test_fixed_path() {
        let locator = FixedPath(PathBuf::from("/tmp/chrome.dll"));
        assert_eq!(locator.locate().unwrap(), PathBuf::from("/tmp/chrome.dll"));
    }
}
