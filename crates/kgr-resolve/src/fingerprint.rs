//! Fingerprinting and blocking
//!
//! Derives deterministic block keys per entity type so that only plausible
//! duplicates are compared pairwise. Rules are a lookup table from type
//! identifier to fingerprint function.

use std::collections::{BTreeSet, HashMap};

use kgr_core::Entity;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Block Keys
// ============================================================================

/// Strength of a block key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Hash of a normalized unique identifier
    Primary,
    /// Normalized composite of weaker attributes
    Fuzzy,
}

/// A comparable blocking key, scoped to one organization and type
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub kind: KeyKind,
    /// `{organization_id}/{type}`
    pub scope: String,
    pub value: String,
}

/// Two entity indices that must be compared, `left < right`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CandidatePair {
    pub left: usize,
    pub right: usize,
}

impl CandidatePair {
    /// Build an ordered pair; `None` for a self-pair
    pub fn new(a: usize, b: usize) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { left: a, right: b }),
            std::cmp::Ordering::Greater => Some(Self { left: b, right: a }),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Fingerprint function: raw key material for one entity
pub type FingerprintFn = fn(&Entity) -> Vec<(KeyKind, String)>;

// ============================================================================
// Normalization
// ============================================================================

static NAME_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[\s,]+(?:jr|sr|ii|iii|iv|esq)\.?)+$").expect("name suffix pattern")
});

static TRAILING_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s.,;:]+$").expect("trailing punctuation pattern"));

/// Lowercase, trim and collapse internal whitespace
pub fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text normalization plus removal of generational/honorific suffixes
pub fn normalize_name(value: &str) -> String {
    let text = normalize_text(value);
    let text = TRAILING_PUNCT.replace(&text, "");
    let text = NAME_SUFFIX.replace(&text, "");
    TRAILING_PUNCT.replace(&text, "").into_owned()
}

/// Lowercase alphanumerics only ("123-45-6789" -> "123456789")
pub fn normalize_identifier(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn attr_text(entity: &Entity, name: &str) -> Option<String> {
    match entity.attributes.get(name)?.value() {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn identifier(entity: &Entity, name: &str) -> Option<String> {
    attr_text(entity, name).and_then(|v| non_empty(normalize_identifier(&v)))
}

fn name(entity: &Entity, attr: &str) -> Option<String> {
    attr_text(entity, attr).and_then(|v| non_empty(normalize_name(&v)))
}

fn text(entity: &Entity, attr: &str) -> Option<String> {
    attr_text(entity, attr).and_then(|v| non_empty(normalize_text(&v)))
}

// ============================================================================
// Default Rules
// ============================================================================

fn person_keys(entity: &Entity) -> Vec<(KeyKind, String)> {
    let mut keys = Vec::new();
    if let Some(tax_id) = identifier(entity, "tax_id") {
        keys.push((KeyKind::Primary, format!("tax_id:{tax_id}")));
    }
    if let (Some(name), Some(dob)) = (name(entity, "name"), text(entity, "date_of_birth")) {
        keys.push((KeyKind::Fuzzy, format!("name_dob:{name}|{dob}")));
    }
    keys
}

fn organization_keys(entity: &Entity) -> Vec<(KeyKind, String)> {
    let mut keys = Vec::new();
    if let Some(tax_id) = identifier(entity, "tax_id") {
        keys.push((KeyKind::Primary, format!("tax_id:{tax_id}")));
    }
    if let Some(lei) = identifier(entity, "lei") {
        keys.push((KeyKind::Primary, format!("lei:{lei}")));
    }
    if let Some(legal_name) = name(entity, "legal_name").or_else(|| name(entity, "name")) {
        keys.push((KeyKind::Fuzzy, format!("name:{legal_name}")));
    }
    keys
}

fn account_keys(entity: &Entity) -> Vec<(KeyKind, String)> {
    let mut keys = Vec::new();
    if let Some(account_id) = identifier(entity, "account_id") {
        keys.push((KeyKind::Primary, format!("account_id:{account_id}")));
    }
    if let (Some(number), Some(custodian)) = (
        identifier(entity, "account_number"),
        identifier(entity, "custodian_id"),
    ) {
        keys.push((KeyKind::Fuzzy, format!("account:{number}|{custodian}")));
    }
    keys
}

fn document_keys(entity: &Entity) -> Vec<(KeyKind, String)> {
    let mut keys = Vec::new();
    if let Some(document_id) = identifier(entity, "document_id") {
        keys.push((KeyKind::Primary, format!("document_id:{document_id}")));
    }
    if let Some(title) = text(entity, "title") {
        keys.push((KeyKind::Fuzzy, format!("title:{title}")));
    }
    keys
}

// ============================================================================
// Blocker
// ============================================================================

/// Per-type fingerprinting and candidate pair generation
#[derive(Clone)]
pub struct Blocker {
    rules: HashMap<String, FingerprintFn>,
}

impl std::fmt::Debug for Blocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types: BTreeSet<&String> = self.rules.keys().collect();
        f.debug_struct("Blocker").field("rules", &types).finish()
    }
}

impl Blocker {
    /// Create a blocker with the default client/account/document rules
    pub fn new() -> Self {
        let mut blocker = Self::empty();
        blocker.init_default_rules();
        blocker
    }

    /// Create a blocker with no rules; every entity falls back to type-wide comparison
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    fn init_default_rules(&mut self) {
        for person in ["Person", "Client", "Individual"] {
            self.add_rule(person, person_keys);
        }
        for organization in ["Organization", "Company"] {
            self.add_rule(organization, organization_keys);
        }
        self.add_rule("Account", account_keys);
        self.add_rule("Document", document_keys);
    }

    fn add_rule(&mut self, entity_type: &str, rule: FingerprintFn) {
        self.rules.insert(entity_type.to_string(), rule);
    }

    /// Register or replace the rule for a type
    pub fn with_rule(mut self, entity_type: impl Into<String>, rule: FingerprintFn) -> Self {
        self.rules.insert(entity_type.into(), rule);
        self
    }

    /// Derive every block key for an entity
    pub fn fingerprint(&self, entity: &Entity) -> BTreeSet<BlockKey> {
        let mut keys = BTreeSet::new();
        for entity_type in &entity.types {
            let Some(rule) = self.rules.get(entity_type) else {
                continue;
            };
            let scope = format!("{}/{}", entity.organization_id, entity_type);
            for (kind, material) in rule(entity) {
                let value = match kind {
                    KeyKind::Primary => hex::encode(Sha256::digest(material.as_bytes())),
                    KeyKind::Fuzzy => material,
                };
                keys.insert(BlockKey {
                    kind,
                    scope: scope.clone(),
                    value,
                });
            }
        }
        keys
    }

    /// All index pairs that must be compared
    ///
    /// Two entities pair when they share a block key. An entity without any
    /// derivable key pairs with every entity of the same organization that
    /// shares one of its types. The result is sorted and duplicate-free.
    pub fn candidate_pairs(&self, entities: &[Entity]) -> Vec<CandidatePair> {
        let fingerprints: Vec<BTreeSet<BlockKey>> =
            entities.par_iter().map(|e| self.fingerprint(e)).collect();

        let mut pairs = BTreeSet::new();

        let mut buckets: HashMap<&BlockKey, Vec<usize>> = HashMap::new();
        for (index, keys) in fingerprints.iter().enumerate() {
            for key in keys {
                buckets.entry(key).or_default().push(index);
            }
        }
        for members in buckets.values() {
            for (offset, &a) in members.iter().enumerate() {
                for &b in &members[offset + 1..] {
                    pairs.extend(CandidatePair::new(a, b));
                }
            }
        }

        let keyless: Vec<usize> = fingerprints
            .iter()
            .enumerate()
            .filter(|(_, keys)| keys.is_empty())
            .map(|(index, _)| index)
            .collect();

        if !keyless.is_empty() {
            let mut by_scope: HashMap<(&str, &str), Vec<usize>> = HashMap::new();
            for (index, entity) in entities.iter().enumerate() {
                for entity_type in &entity.types {
                    by_scope
                        .entry((entity.organization_id.as_str(), entity_type.as_str()))
                        .or_default()
                        .push(index);
                }
            }

            for &index in &keyless {
                let entity = &entities[index];
                for entity_type in &entity.types {
                    let scope = (entity.organization_id.as_str(), entity_type.as_str());
                    for &other in by_scope.get(&scope).into_iter().flatten() {
                        pairs.extend(CandidatePair::new(index, other));
                    }
                }
            }
            tracing::debug!(keyless = keyless.len(), "Keyless entities compared type-wide");
        }

        tracing::debug!(
            entities = entities.len(),
            buckets = buckets.len(),
            pairs = pairs.len(),
            "Candidate pairs generated"
        );
        pairs.into_iter().collect()
    }
}

impl Default for Blocker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> Entity {
        Entity::new(id, "org-1", "Client")
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_text("  Jane   ROE \t"), "jane roe");
        assert_eq!(normalize_name("John  Smith, Jr."), "john smith");
        assert_eq!(normalize_name("Robert Jones III"), "robert jones");
        assert_eq!(normalize_name("Ann Lee, Esq"), "ann lee");
        assert_eq!(normalize_name("Sr. Maria"), "sr. maria");
        assert_eq!(normalize_identifier("123-45-6789"), "123456789");
    }

    #[test]
    fn test_primary_key_is_hashed_and_normalized() {
        let blocker = Blocker::new();
        let a = client("a").with_attribute("tax_id", "123-45-6789");
        let b = client("b").with_attribute("tax_id", " 123 45 6789 ");

        let keys_a = blocker.fingerprint(&a);
        let keys_b = blocker.fingerprint(&b);
        assert_eq!(keys_a.len(), 1);
        assert_eq!(keys_a, keys_b);

        let key = keys_a.iter().next().unwrap();
        assert_eq!(key.kind, KeyKind::Primary);
        assert_eq!(key.scope, "org-1/Client");
        assert_eq!(key.value.len(), 64);
        assert!(key.value.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fuzzy_key_requires_all_fields() {
        let blocker = Blocker::new();
        let name_only = client("a").with_attribute("name", "Jane Roe");
        assert!(blocker.fingerprint(&name_only).is_empty());

        let with_dob = name_only.with_attribute("date_of_birth", "1970-01-01");
        let keys = blocker.fingerprint(&with_dob);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.iter().next().unwrap().value, "name_dob:jane roe|1970-01-01");
    }

    #[test]
    fn test_account_fuzzy_key() {
        let blocker = Blocker::new();
        let account = Entity::new("acct", "org-1", "Account")
            .with_attribute("account_number", "0042-17")
            .with_attribute("custodian_id", "SCHW");
        let keys = blocker.fingerprint(&account);
        assert_eq!(keys.iter().next().unwrap().value, "account:004217|schw");
    }

    #[test]
    fn test_shared_key_pairs() {
        let blocker = Blocker::new();
        let entities = vec![
            client("a").with_attribute("tax_id", "111"),
            client("b").with_attribute("tax_id", "222"),
            client("c").with_attribute("tax_id", "111"),
        ];
        let pairs = blocker.candidate_pairs(&entities);
        assert_eq!(pairs, vec![CandidatePair { left: 0, right: 2 }]);
    }

    #[test]
    fn test_keys_never_cross_organizations() {
        let blocker = Blocker::new();
        let entities = vec![
            client("a").with_attribute("tax_id", "111"),
            Entity::new("b", "org-2", "Client").with_attribute("tax_id", "111"),
        ];
        assert!(blocker.candidate_pairs(&entities).is_empty());
    }

    #[test]
    fn test_keyless_entity_compared_against_whole_type() {
        let blocker = Blocker::new();
        let entities = vec![
            client("a").with_attribute("tax_id", "111"),
            client("b").with_attribute("tax_id", "222"),
            client("keyless"),
            Entity::new("acct", "org-1", "Account").with_attribute("account_id", "9"),
            Entity::new("other-org", "org-2", "Client"),
        ];

        let pairs = blocker.candidate_pairs(&entities);
        assert_eq!(
            pairs,
            vec![
                CandidatePair { left: 0, right: 2 },
                CandidatePair { left: 1, right: 2 },
            ]
        );
    }

    #[test]
    fn test_unregistered_type_falls_back() {
        let blocker = Blocker::new();
        let entities = vec![
            Entity::new("h1", "org-1", "Household"),
            Entity::new("h2", "org-1", "Household"),
        ];
        assert_eq!(
            blocker.candidate_pairs(&entities),
            vec![CandidatePair { left: 0, right: 1 }]
        );
    }

    #[test]
    fn test_custom_rule() {
        fn household_keys(entity: &Entity) -> Vec<(KeyKind, String)> {
            entity
                .attribute_str("address")
                .map(|a| vec![(KeyKind::Fuzzy, normalize_text(a))])
                .unwrap_or_default()
        }

        let blocker = Blocker::new().with_rule("Household", household_keys);
        let entities = vec![
            Entity::new("h1", "org-1", "Household").with_attribute("address", "1 Main St"),
            Entity::new("h2", "org-1", "Household").with_attribute("address", "9 Elm St"),
        ];
        assert!(blocker.candidate_pairs(&entities).is_empty());
    }
}
