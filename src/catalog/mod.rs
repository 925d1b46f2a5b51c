//! Pattern catalog: named byte-patch rules loaded from JSON.

pub mod loader;
pub mod schema;

pub use loader::{load_from_path, load_from_slice, load_from_str, CatalogError};
pub use schema::{
    Catalog, PatchRule, RawBytes, RawCatalog, RawRule, RuleSelection, UnknownRule,
    ValidationError, ValidationIssue,
};
