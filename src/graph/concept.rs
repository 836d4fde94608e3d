use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Normalized deduplication key of a concept (whitespace-collapsed, case-folded)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptKey(String);

impl ConceptKey {
    pub fn new(raw: &str) -> Self {
        Self(display_name(raw).to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConceptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim a name and collapse inner whitespace, keeping its original casing
pub fn display_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether `candidate` is a more specific description than `current`.
///
/// Non-empty beats empty, then longer beats shorter, then the
/// lexicographically smaller string wins so the outcome never depends on
/// the order in which descriptions were seen.
pub fn is_more_specific(candidate: &str, current: &str) -> bool {
    let rank = |s: &str| (!s.is_empty(), s.chars().count(), Reverse(s.to_string()));
    rank(candidate.trim()) > rank(current.trim())
}

/// Kind of concept the extractor may emit
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConceptType {
    Person,
    Organization,
    Location,
    Event,
    Technology,
    Topic,
    #[default]
    Concept,
}

impl ConceptType {
    pub const ALL: [ConceptType; 7] = [
        ConceptType::Person,
        ConceptType::Organization,
        ConceptType::Location,
        ConceptType::Event,
        ConceptType::Technology,
        ConceptType::Topic,
        ConceptType::Concept,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConceptType::Person => "person",
            ConceptType::Organization => "organization",
            ConceptType::Location => "location",
            ConceptType::Event => "event",
            ConceptType::Technology => "technology",
            ConceptType::Topic => "topic",
            ConceptType::Concept => "concept",
        }
    }

    /// `Concept` is the fallback type used when nothing better is known
    pub fn is_generic(&self) -> bool {
        *self == ConceptType::Concept
    }

    /// Pick between two observed types independently of observation order
    fn reconcile(self, other: ConceptType) -> ConceptType {
        match (self.is_generic(), other.is_generic()) {
            (true, _) => other,
            (false, true) => self,
            (false, false) => self.min(other),
        }
    }
}

impl FromStr for ConceptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ConceptType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown concept type '{}'", s))
    }
}

/// Deduplicated named entity or topic node in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    /// Deduplication key derived from the canonical name
    pub key: ConceptKey,
    /// Display form of the name, as first seen
    pub canonical_name: String,
    /// Other surface forms this concept was seen under
    pub aliases: BTreeSet<String>,
    pub concept_type: ConceptType,
    pub description: String,
}

impl Concept {
    pub fn new(name: &str, concept_type: ConceptType) -> Self {
        Self {
            key: ConceptKey::new(name),
            canonical_name: display_name(name),
            aliases: BTreeSet::new(),
            concept_type,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.trim().to_string();
        self
    }

    pub fn with_aliases<'a>(mut self, aliases: impl IntoIterator<Item = &'a str>) -> Self {
        for alias in aliases {
            self.add_alias(alias);
        }
        self
    }

    /// Record a surface form; returns true if it was new.
    ///
    /// Forms that normalize to the concept's own key are not aliases.
    pub fn add_alias(&mut self, alias: &str) -> bool {
        let alias = display_name(alias);
        if alias.is_empty() || ConceptKey::new(&alias) == self.key {
            return false;
        }
        self.aliases.insert(alias)
    }

    pub fn alias_keys(&self) -> impl Iterator<Item = ConceptKey> + '_ {
        self.aliases.iter().map(|a| ConceptKey::new(a))
    }

    /// Fold another sighting of this concept into it.
    ///
    /// Aliases are unioned, the more specific description is kept and a
    /// specific type replaces the generic one. Returns true when anything
    /// changed, so re-merging identical facts reports no update.
    pub fn absorb(&mut self, other: &Concept) -> bool {
        let mut changed = false;

        if other.canonical_name != self.canonical_name {
            changed |= self.add_alias(&other.canonical_name);
        }
        for alias in &other.aliases {
            changed |= self.add_alias(alias);
        }

        if is_more_specific(&other.description, &self.description) {
            self.description = other.description.trim().to_string();
            changed = true;
        }

        let reconciled = self.concept_type.reconcile(other.concept_type);
        if reconciled != self.concept_type {
            self.concept_type = reconciled;
            changed = true;
        }

        changed
    }
}
