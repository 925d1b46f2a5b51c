use crate::backup::BackupError;
use crate::catalog::{CatalogError, UnknownRule};
use crate::edit::EditError;
use crate::safety::SafetyError;
use crate::signature::MatchPolicy;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Everything a patch, restore or evaluate call can fail with.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is locked by another process")]
    Locked { path: PathBuf },

    #[error("another operation is already in progress for {path}")]
    Busy { path: PathBuf },

    #[error("target is not a regular file: {path}")]
    InvalidTarget { path: PathBuf },

    #[error(transparent)]
    UnknownRule(#[from] UnknownRule),

    #[error("rule '{rule_id}' matched {count} locations, expected {policy}")]
    AmbiguousCount {
        rule_id: String,
        count: usize,
        policy: MatchPolicy,
    },

    #[error("signature not found for rule(s): {}", rule_ids.join(", "))]
    NotFound { rule_ids: Vec<String> },

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Edit(#[from] EditError),
}

/// Fieldless classification of [`PatchError`] for callers that render their own messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Catalog,
    Io,
    Locked,
    Busy,
    InvalidTarget,
    UnknownRule,
    AmbiguousCount,
    NotFound,
    BackupMissing,
    BackupCorrupt,
    Edit,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Catalog => "catalog",
            ErrorKind::Io => "io",
            ErrorKind::Locked => "locked",
            ErrorKind::Busy => "busy",
            ErrorKind::InvalidTarget => "invalid-target",
            ErrorKind::UnknownRule => "unknown-rule",
            ErrorKind::AmbiguousCount => "ambiguous-count",
            ErrorKind::NotFound => "not-found",
            ErrorKind::BackupMissing => "backup-missing",
            ErrorKind::BackupCorrupt => "backup-corrupt",
            ErrorKind::Edit => "edit",
        };
        f.write_str(name)
    }
}

impl PatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PatchError::Catalog(_) => ErrorKind::Catalog,
            PatchError::Io { .. } => ErrorKind::Io,
            PatchError::Locked { .. } => ErrorKind::Locked,
            PatchError::Busy { .. } => ErrorKind::Busy,
            PatchError::InvalidTarget { .. } => ErrorKind::InvalidTarget,
            PatchError::UnknownRule(_) => ErrorKind::UnknownRule,
            PatchError::AmbiguousCount { .. } => ErrorKind::AmbiguousCount,
            PatchError::NotFound { .. } => ErrorKind::NotFound,
            PatchError::Backup(BackupError::Missing { .. }) => ErrorKind::BackupMissing,
            PatchError::Backup(BackupError::Corrupt { .. }) => ErrorKind::BackupCorrupt,
            PatchError::Backup(BackupError::Io { .. }) => ErrorKind::Io,
            PatchError::Edit(EditError::Io(_)) => ErrorKind::Io,
            PatchError::Edit(_) => ErrorKind::Edit,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        crate::safety::io_error(&path.into(), source).into()
    }
}

impl From<SafetyError> for PatchError {
    fn from(e: SafetyError) -> Self {
        match e {
            SafetyError::NotRegularFile { path } => PatchError::InvalidTarget { path },
            SafetyError::Locked { path } => PatchError::Locked { path },
            SafetyError::Busy { path } => PatchError::Busy { path },
            SafetyError::Io { path, source } => PatchError::Io { path, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_for_backup_errors() {
        let missing = PatchError::from(BackupError::Missing {
            target: "chrome.dll".into(),
            backup: "chrome.dll.bpbak".into(),
        });
        assert_eq!(missing.kind(), ErrorKind::BackupMissing);

        let corrupt = PatchError::from(BackupError::Corrupt {
            backup: "chrome.dll.bpbak".into(),
            reason: "bad magic".into(),
        });
        assert_eq!(corrupt.kind(), ErrorKind::BackupCorrupt);
    }

    #[test]
    fn test_safety_error_mapping() {
        let locked = PatchError::from(SafetyError::Locked {
            path: "chrome.dll".into(),
        });
        assert_eq!(locked.kind(), ErrorKind::Locked);

        let io = PatchError::io(
            "chrome.dll",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert_eq!(io.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_not_found_lists_rules() {
        let err = PatchError::NotFound {
            rule_ids: vec!["notifications".into(), "auto_update".into()],
        };
        assert_eq!(
            err.to_string(),
            "signature not found for rule(s): notifications, auto_update"
        );
        assert_eq!(ErrorKind::NotFound.to_string(), "not-found");
    }
}
