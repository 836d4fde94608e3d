use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::graph::concept::{is_more_specific, ConceptKey};

/// Confidence assigned to a relationship the model did not score
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Type of directed relationship between concepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    IsA,
    PartOf,
    CapitalOf,
    LocatedIn,
    Contains,
    Causes,
    Uses,
    CreatedBy,
    MemberOf,
    RelatesTo,
}

impl RelationType {
    pub const ALL: [RelationType; 10] = [
        RelationType::IsA,
        RelationType::PartOf,
        RelationType::CapitalOf,
        RelationType::LocatedIn,
        RelationType::Contains,
        RelationType::Causes,
        RelationType::Uses,
        RelationType::CreatedBy,
        RelationType::MemberOf,
        RelationType::RelatesTo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::IsA => "is_a",
            RelationType::PartOf => "part_of",
            RelationType::CapitalOf => "capital_of",
            RelationType::LocatedIn => "located_in",
            RelationType::Contains => "contains",
            RelationType::Causes => "causes",
            RelationType::Uses => "uses",
            RelationType::CreatedBy => "created_by",
            RelationType::MemberOf => "member_of",
            RelationType::RelatesTo => "relates_to",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = String;

    /// Accepts `capital_of`, `Capital Of` and `capital-of` alike
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s
            .trim()
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        RelationType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown relation type '{}'", s))
    }
}

/// Deduplication key of a relationship
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipKey {
    pub source: ConceptKey,
    pub target: ConceptKey,
    pub relation_type: RelationType,
}

impl fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})-[{}]->({})", self.source, self.relation_type, self.target)
    }
}

/// Directed, typed edge between two concepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: ConceptKey,
    pub target: ConceptKey,
    pub relation_type: RelationType,
    pub description: String,
    /// Strength of the relationship [0.0, 1.0]
    pub confidence: f32,
}

impl Relationship {
    pub fn new(source: ConceptKey, target: ConceptKey, relation_type: RelationType) -> Self {
        Self {
            source,
            target,
            relation_type,
            description: String::new(),
            confidence: DEFAULT_CONFIDENCE,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.trim().to_string();
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn key(&self) -> RelationshipKey {
        RelationshipKey {
            source: self.source.clone(),
            target: self.target.clone(),
            relation_type: self.relation_type,
        }
    }

    /// Fold another observation of the same relationship into this one.
    ///
    /// Confidence only ever rises to the maximum observed. The description
    /// follows the highest-confidence observation, with ties settled by
    /// specificity. Returns true when anything changed.
    pub fn absorb(&mut self, other: &Relationship) -> bool {
        let incoming_wins = match other.confidence.total_cmp(&self.confidence) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => is_more_specific(&other.description, &self.description),
        };
        if !incoming_wins {
            return false;
        }

        let changed = other.confidence > self.confidence || other.description != self.description;
        self.confidence = self.confidence.max(other.confidence);
        self.description = other.description.clone();
        changed
    }
}
