//! Masked byte-signature search.
//!
//! A [`Signature`] is a fixed-length run of bytes where any position may be a
//! wildcard. [`Signature::find`] always scans the whole buffer and reports
//! every offset (overlapping hits included) so that a signature which occurs
//! more often than a rule allows is caught instead of silently taking the
//! first hit.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One position of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternByte {
    /// Must equal this value
    Exact(u8),
    /// Matches any value
    Any,
}

impl PatternByte {
    #[inline]
    pub fn matches(self, byte: u8) -> bool {
        match self {
            PatternByte::Exact(expected) => expected == byte,
            PatternByte::Any => true,
        }
    }

    pub fn is_wildcard(self) -> bool {
        matches!(self, PatternByte::Any)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is empty")]
    Empty,

    #[error("invalid signature token '{token}' at position {position}")]
    InvalidToken { token: String, position: usize },

    #[error("compact signature has odd number of hex digits ({digits})")]
    OddLength { digits: usize },
}

/// A byte pattern with optional wildcard positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    bytes: Vec<PatternByte>,
}

impl Signature {
    pub fn new(bytes: Vec<PatternByte>) -> Self {
        Self { bytes }
    }

    /// Signature with no wildcard positions.
    pub fn exact(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.iter().copied().map(PatternByte::Exact).collect(),
        }
    }

    /// Parse a hex signature.
    ///
    /// Accepts the spaced form (`"48 8B ?? 05"`, `??` or `?` for a wildcard)
    /// and the compact form (`"488B??05"`).
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SignatureError::Empty);
        }

        let bytes = if text.contains(char::is_whitespace) {
            Self::parse_spaced(text)?
        } else {
            Self::parse_compact(text)?
        };

        Ok(Self { bytes })
    }

    fn parse_spaced(text: &str) -> Result<Vec<PatternByte>, SignatureError> {
        text.split_whitespace()
            .enumerate()
            .map(|(position, token)| parse_token(token, position))
            .collect()
    }

    fn parse_compact(text: &str) -> Result<Vec<PatternByte>, SignatureError> {
        if text.len() % 2 != 0 {
            return Err(SignatureError::OddLength { digits: text.len() });
        }
        if !text.is_ascii() {
            return Err(SignatureError::InvalidToken {
                token: text.to_string(),
                position: 0,
            });
        }

        (0..text.len())
            .step_by(2)
            .map(|idx| parse_token(&text[idx..idx + 2], idx / 2))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[PatternByte] {
        &self.bytes
    }

    pub fn wildcard_count(&self) -> usize {
        self.bytes.iter().filter(|b| b.is_wildcard()).count()
    }

    /// True if the signature matches `haystack` starting at `offset`.
    pub fn matches_at(&self, haystack: &[u8], offset: usize) -> bool {
        let Some(window) = offset
            .checked_add(self.bytes.len())
            .and_then(|end| haystack.get(offset..end))
        else {
            return false;
        };

        self.bytes
            .iter()
            .zip(window)
            .all(|(pattern, &byte)| pattern.matches(byte))
    }

    /// Every offset in `haystack` where the signature matches.
    ///
    /// The scan is a sliding window anchored on the first concrete byte; it
    /// never stops early.
    pub fn find(&self, haystack: &[u8]) -> Vec<usize> {
        let len = self.bytes.len();
        if len == 0 || haystack.len() < len {
            return Vec::new();
        }
        let last = haystack.len() - len;

        let anchor = self.bytes.iter().enumerate().find_map(|(idx, b)| match b {
            PatternByte::Exact(value) => Some((idx, *value)),
            PatternByte::Any => None,
        });

        let Some((anchor_idx, anchor_byte)) = anchor else {
            return (0..=last).collect();
        };

        (0..=last)
            .filter(|&start| haystack[start + anchor_idx] == anchor_byte)
            .filter(|&start| self.matches_at(haystack, start))
            .collect()
    }
}

fn parse_token(token: &str, position: usize) -> Result<PatternByte, SignatureError> {
    match token {
        "??" | "?" => Ok(PatternByte::Any),
        _ if token.len() == 2 => u8::from_str_radix(token, 16)
            .map(PatternByte::Exact)
            .map_err(|_| SignatureError::InvalidToken {
                token: token.to_string(),
                position,
            }),
        _ => Err(SignatureError::InvalidToken {
            token: token.to_string(),
            position,
        }),
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, byte) in self.bytes.iter().enumerate() {
            if idx > 0 {
                write!(f, " ")?;
            }
            match byte {
                PatternByte::Exact(value) => write!(f, "{value:02X}")?,
                PatternByte::Any => write!(f, "??")?,
            }
        }
        Ok(())
    }
}

/// How many occurrences of a signature a valid target may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    #[default]
    ExactlyOne,
    AtLeastOne,
    ZeroOrMore,
}

impl MatchPolicy {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            MatchPolicy::ExactlyOne => count == 1,
            MatchPolicy::AtLeastOne => count >= 1,
            MatchPolicy::ZeroOrMore => true,
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::ExactlyOne => write!(f, "exactly one"),
            MatchPolicy::AtLeastOne => write!(f, "at least one"),
            MatchPolicy::ZeroOrMore => write!(f, "zero or more"),
        }
    }
}

/// Classification of a rule against a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pattern occurrences satisfy the policy; the rule can be applied.
    Satisfied,
    /// Pattern absent, replacement present: nothing to do.
    AlreadyPatched,
    /// Neither pattern nor replacement present.
    NotFound,
    /// Occurrence count violates the policy.
    AmbiguousCount,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Satisfied => write!(f, "satisfied"),
            Verdict::AlreadyPatched => write!(f, "already patched"),
            Verdict::NotFound => write!(f, "not found"),
            Verdict::AmbiguousCount => write!(f, "ambiguous count"),
        }
    }
}

/// Result of matching one rule against a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Offsets where the pattern matched
    pub offsets: Vec<usize>,
    /// Offsets where the replacement matched (only searched when the pattern is absent)
    pub patched_offsets: Vec<usize>,
    pub verdict: Verdict,
}

impl MatchResult {
    /// Number of occurrences that decided the verdict.
    pub fn count(&self) -> usize {
        if self.offsets.is_empty() {
            self.patched_offsets.len()
        } else {
            self.offsets.len()
        }
    }
}

/// Locate `pattern` in `haystack` and classify the result against `policy`.
///
/// When the pattern is absent the replacement bytes are searched for, so a
/// buffer patched by an earlier run is recognised instead of reported missing.
pub fn classify(
    haystack: &[u8],
    pattern: &Signature,
    replacement: &[u8],
    policy: MatchPolicy,
) -> MatchResult {
    classify_with_reference(haystack, None, pattern, replacement, policy)
}

/// Like [`classify`], but with the pristine bytes of the same file at hand.
///
/// If the pattern is absent from `haystack` and every site where it occurs in
/// `reference` now holds the replacement, the rule is `AlreadyPatched` at
/// exactly those sites, however often the replacement bytes occur elsewhere.
/// Otherwise the whole buffer is searched for the replacement.
pub fn classify_with_reference(
    haystack: &[u8],
    reference: Option<&[u8]>,
    pattern: &Signature,
    replacement: &[u8],
    policy: MatchPolicy,
) -> MatchResult {
    let offsets = pattern.find(haystack);
    if !offsets.is_empty() {
        let verdict = if policy.accepts(offsets.len()) {
            Verdict::Satisfied
        } else {
            Verdict::AmbiguousCount
        };
        return MatchResult {
            offsets,
            patched_offsets: Vec::new(),
            verdict,
        };
    }

    let patched_offsets = reference
        .and_then(|reference| patched_sites(haystack, reference, pattern, replacement))
        .unwrap_or_else(|| Signature::exact(replacement).find(haystack));
    let verdict = if !patched_offsets.is_empty() {
        if policy.accepts(patched_offsets.len()) {
            Verdict::AlreadyPatched
        } else {
            Verdict::AmbiguousCount
        }
    } else if policy.accepts(0) {
        Verdict::Satisfied
    } else {
        Verdict::NotFound
    };

    MatchResult {
        offsets,
        patched_offsets,
        verdict,
    }
}

/// Pattern sites of `reference`, provided `haystack` holds the replacement at all of them.
fn patched_sites(
    haystack: &[u8],
    reference: &[u8],
    pattern: &Signature,
    replacement: &[u8],
) -> Option<Vec<usize>> {
    if reference.len() != haystack.len() || pattern.len() != replacement.len() {
        return None;
    }
    let sites = pattern.find(reference);
    let all_patched = !sites.is_empty()
        && sites
            .iter()
            .all(|&offset| haystack.get(offset..offset + replacement.len()) == Some(replacement));
    all_patched.then_some(sites)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spaced() {
        let sig = Signature::parse("48 8B ?? 05").unwrap();
        assert_eq!(sig.len(), 4);
        assert_eq!(sig.bytes()[0], PatternByte::Exact(0x48));
        assert_eq!(sig.bytes()[2], PatternByte::Any);
        assert_eq!(sig.wildcard_count(), 1);
    }

    #[test]
    fn test_parse_compact() {
        let sig = Signature::parse("488B??05").unwrap();
        assert_eq!(sig, Signature::parse("48 8B ?? 05").unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Signature::parse("  "), Err(SignatureError::Empty));
        assert!(matches!(
            Signature::parse("488"),
            Err(SignatureError::OddLength { digits: 3 })
        ));
        assert!(matches!(
            Signature::parse("48 ZZ"),
            Err(SignatureError::InvalidToken { position: 1, .. })
        ));
        assert!(matches!(
            Signature::parse("48 123"),
            Err(SignatureError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_display_round_trips() {
        let sig = Signature::parse("aa bb ? cc").unwrap();
        assert_eq!(sig.to_string(), "AA BB ?? CC");
        assert_eq!(Signature::parse(&sig.to_string()).unwrap(), sig);
    }

    #[test]
    fn test_find_all_occurrences() {
        let sig = Signature::exact(&[0xAA, 0xBB]);
        let data = [0xAA, 0xBB, 0x00, 0xAA, 0xBB, 0xAA];
        assert_eq!(sig.find(&data), vec![0, 3]);
    }

    #[test]
    fn test_find_overlapping() {
        let sig = Signature::exact(&[0x11, 0x11]);
        assert_eq!(sig.find(&[0x11, 0x11, 0x11]), vec![0, 1]);
    }

    #[test]
    fn test_find_with_wildcard() {
        let sig = Signature::parse("AA ?? CC").unwrap();
        let data = [0xAA, 0x01, 0xCC, 0xAA, 0xFF, 0xCC, 0xAA, 0x00, 0xCD];
        assert_eq!(sig.find(&data), vec![0, 3]);
    }

    #[test]
    fn test_find_leading_wildcard() {
        let sig = Signature::parse("?? BB").unwrap();
        assert_eq!(sig.find(&[0xBB, 0x00, 0xBB]), vec![1]);
    }

    #[test]
    fn test_find_short_haystack() {
        let sig = Signature::exact(&[1, 2, 3]);
        assert!(sig.find(&[1, 2]).is_empty());
        assert!(sig.find(&[]).is_empty());
        assert!(!sig.matches_at(&[1, 2, 3], 1));
        assert!(!sig.matches_at(&[1, 2, 3], usize::MAX));
    }

    #[test]
    fn test_find_at_buffer_end() {
        let sig = Signature::exact(&[0xCC, 0xDD]);
        assert_eq!(sig.find(&[0x00, 0xCC, 0xDD]), vec![1]);
    }

    #[test]
    fn test_policy_accepts() {
        assert!(MatchPolicy::ExactlyOne.accepts(1));
        assert!(!MatchPolicy::ExactlyOne.accepts(0));
        assert!(!MatchPolicy::ExactlyOne.accepts(2));
        assert!(MatchPolicy::AtLeastOne.accepts(3));
        assert!(!MatchPolicy::AtLeastOne.accepts(0));
        assert!(MatchPolicy::ZeroOrMore.accepts(0));
    }

    #[test]
    fn test_classify_satisfied() {
        let sig = Signature::exact(&[0xAA, 0xBB, 0xCC]);
        let result = classify(
            &[0x00, 0xAA, 0xBB, 0xCC, 0x00],
            &sig,
            &[1, 2, 3],
            MatchPolicy::ExactlyOne,
        );
        assert_eq!(result.verdict, Verdict::Satisfied);
        assert_eq!(result.offsets, vec![1]);
    }

    #[test]
    fn test_classify_already_patched() {
        let sig = Signature::exact(&[0xAA, 0xBB, 0xCC]);
        let result = classify(
            &[0x00, 0x01, 0x02, 0x03, 0x00],
            &sig,
            &[1, 2, 3],
            MatchPolicy::ExactlyOne,
        );
        assert_eq!(result.verdict, Verdict::AlreadyPatched);
        assert!(result.offsets.is_empty());
        assert_eq!(result.patched_offsets, vec![1]);
    }

    #[test]
    fn test_classify_not_found() {
        let sig = Signature::exact(&[0xAA, 0xBB, 0xCC]);
        let result = classify(&[0u8; 16], &sig, &[1, 2, 3], MatchPolicy::ExactlyOne);
        assert_eq!(result.verdict, Verdict::NotFound);
    }

    #[test]
    fn test_classify_ambiguous() {
        let sig = Signature::exact(&[0xAA, 0xBB, 0xCC]);
        let data = [0xAA, 0xBB, 0xCC, 0x00, 0xAA, 0xBB, 0xCC];
        let result = classify(&data, &sig, &[1, 2, 3], MatchPolicy::ExactlyOne);
        assert_eq!(result.verdict, Verdict::AmbiguousCount);
        assert_eq!(result.count(), 2);

        let relaxed = classify(&data, &sig, &[1, 2, 3], MatchPolicy::AtLeastOne);
        assert_eq!(relaxed.verdict, Verdict::Satisfied);
    }

    #[test]
    fn test_classify_zero_or_more_absent() {
        let sig = Signature::exact(&[0xAA]);
        let result = classify(&[0u8; 4], &sig, &[0x01], MatchPolicy::ZeroOrMore);
        assert_eq!(result.verdict, Verdict::Satisfied);
        assert!(result.offsets.is_empty());
    }

    #[test]
    fn test_classify_duplicated_replacement_is_ambiguous() {
        let sig = Signature::exact(&[0xAA, 0xBB]);
        let data = [0x01, 0x02, 0x00, 0x01, 0x02];
        let result = classify(&data, &sig, &[1, 2], MatchPolicy::ExactlyOne);
        assert_eq!(result.verdict, Verdict::AmbiguousCount);
    }

    #[test]
    fn test_classify_reference_ignores_stray_replacement_bytes() {
        let sig = Signature::exact(&[0xAA, 0xBB, 0xCC]);
        let pristine = [0x00, 0xAA, 0xBB, 0xCC, 0x00, 0x01, 0x02, 0x03, 0x00];
        let patched = [0x00, 0x01, 0x02, 0x03, 0x00, 0x01, 0x02, 0x03, 0x00];

        let blind = classify(&patched, &sig, &[1, 2, 3], MatchPolicy::ExactlyOne);
        assert_eq!(blind.verdict, Verdict::AmbiguousCount);

        let result = classify_with_reference(
            &patched,
            Some(&pristine),
            &sig,
            &[1, 2, 3],
            MatchPolicy::ExactlyOne,
        );
        assert_eq!(result.verdict, Verdict::AlreadyPatched);
        assert_eq!(result.patched_offsets, vec![1]);
    }

    #[test]
    fn test_classify_reference_requires_every_site_patched() {
        let sig = Signature::exact(&[0xAA, 0xBB]);
        let pristine = [0xAA, 0xBB, 0x00, 0xAA, 0xBB];
        // second site holds something else, so the whole buffer is searched
        let current = [0x01, 0x02, 0x00, 0x07, 0x07];
        let result = classify_with_reference(
            &current,
            Some(&pristine),
            &sig,
            &[1, 2],
            MatchPolicy::AtLeastOne,
        );
        assert_eq!(result.verdict, Verdict::AlreadyPatched);
        assert_eq!(result.patched_offsets, vec![0]);

        // a reference of another size is not the same file
        let result = classify_with_reference(
            &current,
            Some(&pristine[..4]),
            &sig,
            &[1, 2],
            MatchPolicy::ExactlyOne,
        );
        assert_eq!(result.patched_offsets, vec![0]);
        assert_eq!(result.verdict, Verdict::AlreadyPatched);
    }
}
