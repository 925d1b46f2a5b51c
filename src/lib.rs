//! Brave Patcher: reversible byte-signature patching for browser modules
//!
//! Locates known byte signatures inside a binary module (e.g. Brave's
//! `chrome.dll`) and overwrites them in place to switch off notifications,
//! ad pacing limits or auto-update checks, keeping a checksummed pristine
//! copy so every patch can be undone.
//!
//! # Architecture
//!
//! All modifications compile down to a single primitive: [`ByteEdit`], a
//! verified same-length overwrite. Intelligence lives in span acquisition
//! (the [`signature`] matcher driven by the [`catalog`]), not in application.
//!
//! # Safety
//!
//! - Replacements never change the file size
//! - A rule whose signature is missing or occurs an unexpected number of
//!   times fails the whole session; nothing is written
//! - The pristine bytes are backed up before the first write
//! - Atomic file writes (tempfile + fsync + rename)
//! - One in-flight operation per target path
//! - Idempotent: patching a patched file is a no-op
//!
//! # Example
//!
//! ```no_run
//! use brave_patcher::{catalog, BackupStore, PatchEngine, RuleSelection};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = catalog::load_from_path("patterns.json")?;
//! let engine = PatchEngine::new(catalog, BackupStore::default());
//!
//! let report = engine.patch("chrome.dll", &RuleSelection::CatalogDefaults)?;
//! println!("{} bytes changed", report.bytes_changed);
//!
//! if engine.has_backup("chrome.dll") {
//!     engine.restore("chrome.dll")?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod catalog;
pub mod edit;
pub mod engine;
pub mod locate;
pub mod safety;
pub mod settings;
pub mod signature;

// Re-exports
pub use backup::{BackupError, BackupRecord, BackupStore};
pub use catalog::{
    load_from_path, load_from_str, Catalog, CatalogError, PatchRule, RuleSelection,
};
pub use edit::{ByteEdit, EditError, EditResult, EditVerification};
pub use engine::{
    ErrorKind, Evaluation, PatchEngine, PatchError, PatchReport, RestoreReport, RuleOutcome,
    SessionState,
};
pub use locate::{DirectoryScan, FixedPath, LocateError, TargetLocator};
pub use safety::{SafetyError, TargetGuard};
pub use settings::{Settings, SettingsError};
pub use signature::{MatchPolicy, MatchResult, PatternByte, Signature, Verdict};
