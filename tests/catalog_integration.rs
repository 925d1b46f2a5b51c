//! Catalog loading against files on disk

use brave_patcher::catalog::{self, CatalogError, ValidationIssue};
use brave_patcher::{MatchPolicy, PatternByte, RuleSelection};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_fixture_catalog_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/patterns.json");
    let catalog = catalog::load_from_path(&path).unwrap();

    let ids: Vec<_> = catalog.ids().collect();
    assert_eq!(ids, vec!["notifications", "ads_limits", "ads_pace", "auto_update"]);

    let ads_limits = catalog.get("ads_limits").unwrap();
    assert_eq!(ads_limits.pattern().wildcard_count(), 1);
    assert_eq!(ads_limits.pattern().bytes()[2], PatternByte::Any);
    assert_eq!(ads_limits.replacement(), &[0x90; 4]);

    assert!(!catalog.get("ads_pace").unwrap().enabled());
    assert_eq!(
        catalog.get("auto_update").unwrap().expected(),
        MatchPolicy::AtLeastOne
    );

    let defaults = catalog.select(&RuleSelection::CatalogDefaults).unwrap();
    assert_eq!(defaults.len(), 3);
}

#[test]
fn test_every_problem_reported_at_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("patterns.json");
    fs::write(
        &path,
        r#"{
            "short": { "pattern": [1, 2, 3], "replacement": [1, 2] },
            "wild": { "pattern": [null, null], "replacement": [0, 0] },
            "big": { "pattern": [1, 300], "replacement": [0, 0] }
        }"#,
    )
    .unwrap();

    let err = catalog::load_from_path(&path).unwrap_err();
    let validation = err.validation().expect("validation error");
    assert_eq!(validation.issues.len(), 3);
    assert!(validation
        .issues
        .iter()
        .any(|i| matches!(i, ValidationIssue::LengthMismatch { .. })));
    assert!(validation
        .issues
        .iter()
        .any(|i| matches!(i, ValidationIssue::WildcardOnlyPattern { .. })));
    assert!(validation
        .issues
        .iter()
        .any(|i| matches!(i, ValidationIssue::ByteOutOfRange { .. })));

    let message = err.to_string();
    assert!(message.contains("patterns.json"));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let err = catalog::load_from_path(dir.path().join("missing.json")).unwrap_err();
    assert!(matches!(err, CatalogError::Io { .. }));
}

#[test]
fn test_unknown_rule_suggestion() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/patterns.json");
    let catalog = catalog::load_from_path(&path).unwrap();

    let err = catalog
        .select(&RuleSelection::Only(vec!["notification".into()]))
        .unwrap_err();
    assert_eq!(err.id, "notification");
    assert_eq!(err.suggestion.as_deref(), Some("notifications"));
    assert!(err.to_string().contains("did you mean"));
}

#[test]
fn test_serialized_catalog_reloads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/patterns.json");
    let catalog = catalog::load_from_path(&path).unwrap();

    let json = catalog.to_json_string().unwrap();
    let reloaded = catalog::load_from_str(&json).unwrap();
    assert_eq!(reloaded, catalog);
}
