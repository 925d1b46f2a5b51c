use crate::signature::{MatchPolicy, PatternByte, Signature};
use indexmap::IndexMap;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Catalog document as it appears on disk, before validation.
///
/// Entries keep declaration order and duplicates are preserved so that
/// validation can report them.
#[derive(Debug, Default, Clone)]
pub struct RawCatalog {
    pub rules: Vec<(String, RawRule)>,
}

impl<'de> Deserialize<'de> for RawCatalog {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RawCatalogVisitor;

        impl<'de> Visitor<'de> for RawCatalogVisitor {
            type Value = RawCatalog;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of rule id to rule definition")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut rules = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((id, rule)) = map.next_entry::<String, RawRule>()? {
                    rules.push((id, rule));
                }
                Ok(RawCatalog { rules })
            }
        }

        deserializer.deserialize_map(RawCatalogVisitor)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawRule {
    pub pattern: RawBytes,
    pub replacement: RawBytes,
    #[serde(default)]
    pub expected: MatchPolicy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Byte sequence encoding accepted in a catalog.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum RawBytes {
    /// `[170, 187, null, 204]`, `null` marks a wildcard
    List(Vec<Option<i64>>),
    /// `"AA BB ?? CC"` or `"AABB??CC"`
    Hex(String),
}

impl RawBytes {
    fn to_pattern(
        &self,
        rule_id: &str,
        field: &'static str,
        issues: &mut Vec<ValidationIssue>,
    ) -> Option<Vec<PatternByte>> {
        match self {
            RawBytes::Hex(text) => match Signature::parse(text) {
                Ok(sig) => Some(sig.bytes().to_vec()),
                Err(e) => {
                    issues.push(ValidationIssue::InvalidBytes {
                        rule_id: rule_id.to_string(),
                        field,
                        message: e.to_string(),
                    });
                    None
                }
            },
            RawBytes::List(values) => {
                let mut bytes = Vec::with_capacity(values.len());
                let mut valid = true;
                for (index, value) in values.iter().enumerate() {
                    match value {
                        None => bytes.push(PatternByte::Any),
                        Some(v) => match u8::try_from(*v) {
                            Ok(b) => bytes.push(PatternByte::Exact(b)),
                            Err(_) => {
                                issues.push(ValidationIssue::ByteOutOfRange {
                                    rule_id: rule_id.to_string(),
                                    field,
                                    index,
                                    value: *v,
                                });
                                valid = false;
                            }
                        },
                    }
                }
                valid.then_some(bytes)
            }
        }
    }
}

impl RawCatalog {
    /// Validate every rule, collecting all issues. Never returns a partial catalog.
    pub fn validate(self) -> Result<Catalog, ValidationError> {
        let mut issues = Vec::new();

        if self.rules.is_empty() {
            issues.push(ValidationIssue::EmptyCatalog);
        }

        let mut rules: IndexMap<String, PatchRule> = IndexMap::with_capacity(self.rules.len());

        for (id, raw) in self.rules {
            if id.trim().is_empty() {
                issues.push(ValidationIssue::EmptyId);
                continue;
            }
            if rules.contains_key(&id) {
                issues.push(ValidationIssue::DuplicateId { id });
                continue;
            }

            let pattern = raw.pattern.to_pattern(&id, "pattern", &mut issues);
            let replacement = raw.replacement.to_pattern(&id, "replacement", &mut issues);
            let (Some(pattern), Some(replacement)) = (pattern, replacement) else {
                continue;
            };

            let mut replacement_bytes = Vec::with_capacity(replacement.len());
            for (index, byte) in replacement.iter().enumerate() {
                match byte {
                    PatternByte::Exact(b) => replacement_bytes.push(*b),
                    PatternByte::Any => issues.push(ValidationIssue::WildcardInReplacement {
                        rule_id: id.clone(),
                        index,
                    }),
                }
            }
            if replacement_bytes.len() != replacement.len() {
                continue;
            }

            match PatchRule::new(id.clone(), Signature::new(pattern), replacement_bytes, raw.expected) {
                Ok(rule) => {
                    let rule = rule.with_enabled(raw.enabled);
                    let rule = match raw.description {
                        Some(description) => rule.with_description(description),
                        None => rule,
                    };
                    rules.insert(id, rule);
                }
                Err(error) => issues.extend(error.issues),
            }
        }

        if issues.is_empty() {
            Ok(Catalog { rules })
        } else {
            Err(ValidationError { issues })
        }
    }
}

/// One named byte transformation.
///
/// `pattern` and `replacement` always have the same length; construction
/// through [`PatchRule::new`] or catalog loading enforces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRule {
    id: String,
    pattern: Signature,
    replacement: Vec<u8>,
    expected: MatchPolicy,
    enabled: bool,
    description: Option<String>,
}

impl PatchRule {
    pub fn new(
        id: impl Into<String>,
        pattern: Signature,
        replacement: Vec<u8>,
        expected: MatchPolicy,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        let mut issues = Vec::new();

        if id.trim().is_empty() {
            issues.push(ValidationIssue::EmptyId);
        }
        if pattern.is_empty() {
            issues.push(ValidationIssue::EmptyPattern { rule_id: id.clone() });
        } else if pattern.wildcard_count() == pattern.len() {
            issues.push(ValidationIssue::WildcardOnlyPattern { rule_id: id.clone() });
        }
        if pattern.len() != replacement.len() {
            issues.push(ValidationIssue::LengthMismatch {
                rule_id: id.clone(),
                pattern_len: pattern.len(),
                replacement_len: replacement.len(),
            });
        } else if issues.is_empty() && pattern.matches_at(&replacement, 0) {
            issues.push(ValidationIssue::NoOpReplacement { rule_id: id.clone() });
        }

        if !issues.is_empty() {
            return Err(ValidationError { issues });
        }

        Ok(Self {
            id,
            pattern,
            replacement,
            expected,
            enabled: true,
            description: None,
        })
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> &Signature {
        &self.pattern
    }

    pub fn replacement(&self) -> &[u8] {
        &self.replacement
    }

    pub fn expected(&self) -> MatchPolicy {
        self.expected
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn len(&self) -> usize {
        self.replacement.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replacement.is_empty()
    }
}

/// Which rules take part in a patch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RuleSelection {
    /// Rules whose catalog `enabled` flag is set
    #[default]
    CatalogDefaults,
    /// Every rule in the catalog
    All,
    /// Exactly these ids, in catalog order
    Only(Vec<String>),
}

/// A rule id that is not in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRule {
    pub id: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for UnknownRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.suggestion {
            Some(s) => write!(f, "unknown rule '{}' (did you mean '{}'?)", self.id, s),
            None => write!(f, "unknown rule '{}'", self.id),
        }
    }
}

impl std::error::Error for UnknownRule {}

const SUGGESTION_THRESHOLD: f64 = 0.8;

/// Validated set of patch rules, indexed by id, iterated in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    rules: IndexMap<String, PatchRule>,
}

impl Catalog {
    /// Build a catalog from already-constructed rules.
    pub fn from_rules(rules: impl IntoIterator<Item = PatchRule>) -> Result<Self, ValidationError> {
        let mut map = IndexMap::new();
        let mut issues = Vec::new();
        for rule in rules {
            if map.contains_key(rule.id()) {
                issues.push(ValidationIssue::DuplicateId {
                    id: rule.id().to_string(),
                });
                continue;
            }
            map.insert(rule.id().to_string(), rule);
        }
        if map.is_empty() && issues.is_empty() {
            issues.push(ValidationIssue::EmptyCatalog);
        }
        if issues.is_empty() {
            Ok(Self { rules: map })
        } else {
            Err(ValidationError { issues })
        }
    }

    pub fn get(&self, id: &str) -> Option<&PatchRule> {
        self.rules.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchRule> {
        self.rules.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve a selection to rules in catalog order.
    pub fn select(&self, selection: &RuleSelection) -> Result<Vec<&PatchRule>, UnknownRule> {
        match selection {
            RuleSelection::CatalogDefaults => Ok(self.iter().filter(|r| r.enabled()).collect()),
            RuleSelection::All => Ok(self.iter().collect()),
            RuleSelection::Only(ids) => {
                if let Some(missing) = ids.iter().find(|id| !self.contains(id)) {
                    return Err(UnknownRule {
                        id: missing.clone(),
                        suggestion: self.suggest(missing),
                    });
                }
                Ok(self
                    .iter()
                    .filter(|rule| ids.iter().any(|id| id == rule.id()))
                    .collect())
            }
        }
    }

    /// Closest known id to `id`, if any is close enough.
    pub fn suggest(&self, id: &str) -> Option<String> {
        self.ids()
            .map(|candidate| (candidate, strsim::jaro_winkler(id, candidate)))
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(candidate, _)| candidate.to_string())
    }

    /// Serialize back to the catalog document format.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Serialize for Catalog {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        struct RuleRepr<'a> {
            pattern: Vec<Option<u8>>,
            replacement: &'a [u8],
            expected: MatchPolicy,
            enabled: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            description: Option<&'a str>,
        }

        let mut map = serializer.serialize_map(Some(self.rules.len()))?;
        for (id, rule) in &self.rules {
            let pattern = rule
                .pattern()
                .bytes()
                .iter()
                .map(|b| match b {
                    PatternByte::Exact(v) => Some(*v),
                    PatternByte::Any => None,
                })
                .collect();
            map.serialize_entry(
                id,
                &RuleRepr {
                    pattern,
                    replacement: rule.replacement(),
                    expected: rule.expected(),
                    enabled: rule.enabled(),
                    description: rule.description(),
                },
            )?;
        }
        map.end()
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    EmptyCatalog,
    EmptyId,
    DuplicateId {
        id: String,
    },
    InvalidBytes {
        rule_id: String,
        field: &'static str,
        message: String,
    },
    ByteOutOfRange {
        rule_id: String,
        field: &'static str,
        index: usize,
        value: i64,
    },
    EmptyPattern {
        rule_id: String,
    },
    WildcardOnlyPattern {
        rule_id: String,
    },
    WildcardInReplacement {
        rule_id: String,
        index: usize,
    },
    LengthMismatch {
        rule_id: String,
        pattern_len: usize,
        replacement_len: usize,
    },
    NoOpReplacement {
        rule_id: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::EmptyCatalog => write!(f, "pattern catalog contains no rules"),
            ValidationIssue::EmptyId => write!(f, "rule id must not be empty"),
            ValidationIssue::DuplicateId { id } => write!(f, "rule '{id}' is defined more than once"),
            ValidationIssue::InvalidBytes {
                rule_id,
                field,
                message,
            } => write!(f, "rule '{rule_id}' has invalid {field}: {message}"),
            ValidationIssue::ByteOutOfRange {
                rule_id,
                field,
                index,
                value,
            } => write!(
                f,
                "rule '{rule_id}' {field}[{index}] = {value} is outside 0-255"
            ),
            ValidationIssue::EmptyPattern { rule_id } => {
                write!(f, "rule '{rule_id}' has an empty pattern")
            }
            ValidationIssue::WildcardOnlyPattern { rule_id } => {
                write!(f, "rule '{rule_id}' pattern consists only of wildcards")
            }
            ValidationIssue::WildcardInReplacement { rule_id, index } => {
                write!(f, "rule '{rule_id}' replacement[{index}] is a wildcard")
            }
            ValidationIssue::LengthMismatch {
                rule_id,
                pattern_len,
                replacement_len,
            } => write!(
                f,
                "rule '{rule_id}' pattern is {pattern_len} bytes but replacement is {replacement_len} bytes"
            ),
            ValidationIssue::NoOpReplacement { rule_id } => {
                write!(f, "rule '{rule_id}' replacement still matches its own pattern")
            }
        }
    }
}
