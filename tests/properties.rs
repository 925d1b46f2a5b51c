//! Property-based tests for matching, patching and restoring.

use brave_patcher::{
    BackupStore, Catalog, MatchPolicy, PatchEngine, PatchRule, PatternByte, RuleSelection,
    Signature,
};
use proptest::prelude::*;
use std::fs;

fn pattern_byte_strategy() -> impl Strategy<Value = PatternByte> {
    prop_oneof![
        4 => any::<u8>().prop_map(PatternByte::Exact),
        1 => Just(PatternByte::Any),
    ]
}

/// A module with one signature site and, optionally, a stray copy of the
/// replacement bytes somewhere else. Bytes are unconstrained.
#[derive(Debug, Clone)]
struct Module {
    original: Vec<u8>,
    site: usize,
    pattern: Vec<u8>,
    replacement: Vec<u8>,
}

fn module_strategy() -> impl Strategy<Value = Module> {
    (3usize..10)
        .prop_flat_map(|len| {
            (
                prop::collection::vec(any::<u8>(), 0..256),
                prop::collection::vec(any::<u8>(), len),
                prop::collection::vec(any::<u8>(), len),
                any::<bool>(),
                any::<prop::sample::Index>(),
                any::<prop::sample::Index>(),
            )
        })
        .prop_map(|(filler, pattern, replacement, stray, a, b)| {
            let (a, b) = (a.index(filler.len() + 1), b.index(filler.len() + 1));
            let (first, second) = (a.min(b), a.max(b));
            let mut original = filler[..first].to_vec();
            let site = original.len();
            original.extend_from_slice(&pattern);
            original.extend_from_slice(&filler[first..second]);
            if stray {
                original.extend_from_slice(&replacement);
            }
            original.extend_from_slice(&filler[second..]);
            Module {
                original,
                site,
                pattern,
                replacement,
            }
        })
}

fn single_rule_engine(pattern: &[u8], replacement: &[u8]) -> PatchEngine {
    let rule = PatchRule::new(
        "rule",
        Signature::exact(pattern),
        replacement.to_vec(),
        MatchPolicy::ExactlyOne,
    )
    .unwrap();
    PatchEngine::new(Catalog::from_rules([rule]).unwrap(), BackupStore::default())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// `find` reports exactly the offsets where `matches_at` holds, in order.
    #[test]
    fn find_agrees_with_matches_at(
        haystack in prop::collection::vec(0u8..4, 0..128),
        pattern in prop::collection::vec(pattern_byte_strategy(), 1..6),
    ) {
        prop_assume!(pattern.iter().any(|b| !b.is_wildcard()));
        let signature = Signature::new(pattern);

        let expected: Vec<usize> = (0..haystack.len())
            .filter(|&offset| signature.matches_at(&haystack, offset))
            .collect();
        prop_assert_eq!(signature.find(&haystack), expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Patching keeps the size, is idempotent and restore brings back the original bytes.
    #[test]
    fn patch_restore_round_trip(module in module_strategy()) {
        let Module { original, site, pattern, replacement } = module;
        let signature = Signature::exact(&pattern);
        prop_assume!(pattern != replacement);
        prop_assume!(signature.find(&original) == vec![site]);

        let mut expected = original.clone();
        expected[site..site + pattern.len()].copy_from_slice(&replacement);
        prop_assume!(signature.find(&expected).is_empty());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chrome.dll");
        fs::write(&path, &original).unwrap();

        let engine = single_rule_engine(&pattern, &replacement);

        engine.patch(&path, &RuleSelection::All).unwrap();
        let patched = fs::read(&path).unwrap();
        prop_assert_eq!(patched.len(), original.len());
        prop_assert_eq!(&patched, &expected);

        let second = engine.patch(&path, &RuleSelection::All).unwrap();
        prop_assert!(!second.changed());
        prop_assert_eq!(fs::read(&path).unwrap(), patched);

        let restored = engine.restore(&path).unwrap();
        prop_assert_eq!(restored.size, original.len());
        prop_assert_eq!(fs::read(&path).unwrap(), original);
        prop_assert!(engine.has_backup(&path));
    }
}
