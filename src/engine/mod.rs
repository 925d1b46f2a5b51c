//! Patch engine - evaluates catalog rules against a target and commits them atomically
//!
//! A patch session walks `Idle -> Loaded -> Evaluated -> Applying -> Committed`
//! and fails on the first error: the `Err(PatchError)` is the failed state and
//! [`PatchError::kind`] its reason. All replacements happen in an
//! in-memory copy of the target; the file on disk is touched once, by an
//! atomic swap at the end, so a failed session leaves it byte-identical.

mod error;

pub use error::{ErrorKind, PatchError};

use crate::backup::{BackupRecord, BackupStore};
use crate::catalog::{Catalog, PatchRule, RuleSelection};
use crate::edit::{atomic_write, ByteEdit, EditResult, EditVerification};
use crate::safety::{self, TargetGuard};
use crate::signature::{classify_with_reference, MatchResult, Verdict};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

/// Phase of a patch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Loaded,
    Evaluated,
    Applying,
    Committed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Loaded => write!(f, "loaded"),
            SessionState::Evaluated => write!(f, "evaluated"),
            SessionState::Applying => write!(f, "applying"),
            SessionState::Committed => write!(f, "committed"),
        }
    }
}

/// What a session did with one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// Replacement written at these offsets
    Applied { offsets: Vec<usize> },
    /// Replacement already present at these offsets
    AlreadyPatched { offsets: Vec<usize> },
    /// Zero occurrences, which the rule's policy allows
    Skipped,
}

impl fmt::Display for RuleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleOutcome::Applied { offsets } => write!(f, "applied at {}", format_offsets(offsets)),
            RuleOutcome::AlreadyPatched { offsets } => {
                write!(f, "already patched at {}", format_offsets(offsets))
            }
            RuleOutcome::Skipped => write!(f, "skipped (no occurrences)"),
        }
    }
}

pub fn format_offsets(offsets: &[usize]) -> String {
    offsets
        .iter()
        .map(|o| format!("{o:#x}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result of a successful [`PatchEngine::patch`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "PatchReport should be checked to see what was written"]
pub struct PatchReport {
    pub target: PathBuf,
    pub state: SessionState,
    /// Per-rule outcome in catalog order
    pub outcomes: Vec<(String, RuleOutcome)>,
    pub backup_created: bool,
    pub checksum_before: u64,
    pub checksum_after: u64,
    pub bytes_changed: usize,
}

impl PatchReport {
    /// True if the target file was rewritten.
    pub fn changed(&self) -> bool {
        self.bytes_changed > 0
    }
}

/// Result of a successful restore.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct RestoreReport {
    pub target: PathBuf,
    pub checksum: u64,
    pub size: usize,
    pub backup_discarded: bool,
}

/// Read-only status of a target against a rule selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub target: PathBuf,
    pub size: usize,
    pub checksum: u64,
    pub backup: Option<BackupRecord>,
    pub results: Vec<(String, MatchResult)>,
}

impl Evaluation {
    /// True if every evaluated rule is already applied.
    pub fn fully_patched(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|(_, r)| r.verdict == Verdict::AlreadyPatched)
    }
}

/// Orchestrates catalog, matcher and backup store for one target at a time.
///
/// Operations on the same canonical path are serialized process-wide; a
/// concurrent call fails with [`PatchError::Busy`].
#[derive(Debug, Clone)]
pub struct PatchEngine {
    catalog: Catalog,
    backups: BackupStore,
}

impl PatchEngine {
    pub fn new(catalog: Catalog, backups: BackupStore) -> Self {
        Self { catalog, backups }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// True iff a valid backup exists for `path`.
    pub fn has_backup(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.backups.has_backup(&resolved)
    }

    /// Match the selected rules against `path` without modifying anything.
    pub fn evaluate(
        &self,
        path: impl AsRef<Path>,
        selection: &RuleSelection,
    ) -> Result<Evaluation, PatchError> {
        let rules = self.catalog.select(selection)?;
        let target = safety::validate_target(path)?;
        let buffer = fs::read(&target).map_err(|source| PatchError::io(&target, source))?;
        let reference = pristine_reference(&self.backups, &target, &buffer);

        let results = rules
            .iter()
            .map(|rule| {
                let result = match_rule(rule, &buffer, reference.as_deref());
                (rule.id().to_string(), result)
            })
            .collect();

        Ok(Evaluation {
            backup: self.backups.inspect(&target),
            size: buffer.len(),
            checksum: xxh3_64(&buffer),
            target,
            results,
        })
    }

    /// Apply every selected rule to `path`, or none of them.
    pub fn patch(
        &self,
        path: impl AsRef<Path>,
        selection: &RuleSelection,
    ) -> Result<PatchReport, PatchError> {
        let rules = self.catalog.select(selection)?;
        let target = safety::validate_target(path)?;
        let _guard = TargetGuard::acquire(&target)?;

        let mut session = Session::new(target);
        let result = session.run(&self.backups, &rules);
        if let Err(e) = &result {
            session.fail(e);
        }
        result
    }

    /// Write the pristine bytes recorded for `path` back over it. The backup is kept.
    pub fn restore(&self, path: impl AsRef<Path>) -> Result<RestoreReport, PatchError> {
        self.restore_inner(path.as_ref(), false)
    }

    /// Restore `path` and then delete its backup artifact.
    pub fn restore_and_discard(&self, path: impl AsRef<Path>) -> Result<RestoreReport, PatchError> {
        self.restore_inner(path.as_ref(), true)
    }

    fn restore_inner(&self, path: &Path, discard: bool) -> Result<RestoreReport, PatchError> {
        let target = safety::validate_target(path)?;
        let _guard = TargetGuard::acquire(&target)?;

        let pristine = self.backups.restore(&target)?;
        safety::check_writable(&target)?;
        atomic_write(&target, &pristine).map_err(|source| PatchError::io(&target, source))?;

        let checksum = xxh3_64(&pristine);
        log::info!(
            "restored {} ({} bytes, xxh3 {:016x})",
            target.display(),
            pristine.len(),
            checksum
        );

        if discard {
            self.backups.discard(&target)?;
        }

        Ok(RestoreReport {
            target,
            checksum,
            size: pristine.len(),
            backup_discarded: discard,
        })
    }
}

/// Backed-up pristine bytes of `target`, used to tell our own patch sites
/// apart from replacement bytes that occur naturally elsewhere.
fn pristine_reference(backups: &BackupStore, target: &Path, current: &[u8]) -> Option<Vec<u8>> {
    let pristine = backups.restore(target).ok()?;
    if pristine.len() != current.len() {
        log::debug!(
            "backup of {} holds {} bytes, target has {}; not using it to detect patched sites",
            target.display(),
            pristine.len(),
            current.len()
        );
        return None;
    }
    Some(pristine)
}

fn match_rule(rule: &PatchRule, buffer: &[u8], reference: Option<&[u8]>) -> MatchResult {
    let result = classify_with_reference(
        buffer,
        reference,
        rule.pattern(),
        rule.replacement(),
        rule.expected(),
    );
    log::debug!(
        "rule '{}': {} ({} occurrence(s))",
        rule.id(),
        result.verdict,
        result.count()
    );
    result
}

/// One pass of the patch state machine over a single target.
struct Session {
    target: PathBuf,
    state: SessionState,
}

impl Session {
    fn new(target: PathBuf) -> Self {
        Self {
            target,
            state: SessionState::Idle,
        }
    }

    fn transition(&mut self, next: SessionState) {
        log::debug!("{}: {} -> {}", self.target.display(), self.state, next);
        self.state = next;
    }

    fn fail(&self, error: &PatchError) {
        log::debug!(
            "{}: {} -> failed ({})",
            self.target.display(),
            self.state,
            error.kind()
        );
    }

    fn run(&mut self, backups: &BackupStore, rules: &[&PatchRule]) -> Result<PatchReport, PatchError> {
        // Idle -> Loaded
        let buffer = safety::read_target(&self.target)?;
        let original_len = buffer.len();
        let checksum_before = xxh3_64(&buffer);
        self.transition(SessionState::Loaded);

        // Loaded -> Evaluated
        let reference = pristine_reference(backups, &self.target, &buffer);
        let mut evaluated = Vec::with_capacity(rules.len());
        let mut missing = Vec::new();
        for rule in rules {
            let result = match_rule(rule, &buffer, reference.as_deref());
            match result.verdict {
                Verdict::AmbiguousCount => {
                    return Err(PatchError::AmbiguousCount {
                        rule_id: rule.id().to_string(),
                        count: result.count(),
                        policy: rule.expected(),
                    });
                }
                Verdict::NotFound => missing.push(rule.id().to_string()),
                Verdict::Satisfied | Verdict::AlreadyPatched => {}
            }
            evaluated.push((*rule, result));
        }
        if !missing.is_empty() {
            return Err(PatchError::NotFound { rule_ids: missing });
        }
        self.transition(SessionState::Evaluated);

        let outcomes: Vec<(String, RuleOutcome)> = evaluated
            .iter()
            .map(|(rule, result)| {
                let outcome = match result.verdict {
                    Verdict::AlreadyPatched => RuleOutcome::AlreadyPatched {
                        offsets: result.patched_offsets.clone(),
                    },
                    _ if result.offsets.is_empty() => RuleOutcome::Skipped,
                    _ => RuleOutcome::Applied {
                        offsets: result.offsets.clone(),
                    },
                };
                (rule.id().to_string(), outcome)
            })
            .collect();

        let edits: Vec<ByteEdit> = evaluated
            .iter()
            .filter(|(_, result)| result.verdict == Verdict::Satisfied)
            .flat_map(|(rule, result)| {
                result.offsets.iter().map(move |&offset| {
                    ByteEdit::new(
                        rule.id(),
                        offset,
                        rule.replacement(),
                        EditVerification::Signature(rule.pattern().clone()),
                    )
                })
            })
            .collect();

        if edits.is_empty() {
            log::info!("{}: nothing to patch", self.target.display());
            self.transition(SessionState::Committed);
            return Ok(self.report(outcomes, false, checksum_before, checksum_before, 0));
        }

        // Overlapping edits must fail before the backup is written
        let mut patched = buffer.clone();
        let results = ByteEdit::apply_batch(edits, &mut patched)?;
        debug_assert_eq!(patched.len(), original_len);

        // Evaluated -> Applying
        let backup = backups.ensure_backup(&self.target, &buffer)?;
        self.transition(SessionState::Applying);
        let bytes_changed = results
            .iter()
            .map(|r| match r {
                EditResult::Applied { bytes_changed, .. } => *bytes_changed,
                EditResult::AlreadyApplied { .. } => 0,
            })
            .sum();

        // Applying -> Committed
        if bytes_changed == 0 {
            self.transition(SessionState::Committed);
            return Ok(self.report(outcomes, backup.created(), checksum_before, checksum_before, 0));
        }
        atomic_write(&self.target, &patched).map_err(|source| PatchError::io(&self.target, source))?;
        let checksum_after = xxh3_64(&patched);
        log::info!(
            "patched {} ({} bytes changed, xxh3 {:016x} -> {:016x})",
            self.target.display(),
            bytes_changed,
            checksum_before,
            checksum_after
        );
        self.transition(SessionState::Committed);

        Ok(self.report(
            outcomes,
            backup.created(),
            checksum_before,
            checksum_after,
            bytes_changed,
        ))
    }

    fn report(
        &self,
        outcomes: Vec<(String, RuleOutcome)>,
        backup_created: bool,
        checksum_before: u64,
        checksum_after: u64,
        bytes_changed: usize,
    ) -> PatchReport {
        PatchReport {
            target: self.target.clone(),
            state: self.state,
            outcomes,
            backup_created,
            checksum_before,
            checksum_after,
            bytes_changed,
        }
    }
}
