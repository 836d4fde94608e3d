//! Turning a chunk into candidate concepts and relationships.
//!
//! The model is asked for JSON matching [`Extractor::schema`]; the reply is
//! validated field by field before anything reaches the merger.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::contract::{call_with_retry, parse_json};
use crate::error::PipelineError;
use crate::external::{LanguageModel, ModelRequest};
use crate::graph::{
    Chunk, Concept, ConceptKey, ConceptType, RelationType, Relationship, RelationshipKey,
    DEFAULT_CONFIDENCE,
};

const SYSTEM_PROMPT: &str = "You are an expert at extracting knowledge graphs from text. \
     Return valid JSON only. Keep descriptions short and factual.";

/// Candidate facts extracted from one chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionResult {
    pub concepts: Vec<Concept>,
    pub relationships: Vec<Relationship>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty() && self.relationships.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    concepts: Vec<RawConcept>,
    relationships: Vec<RawRelationship>,
}

#[derive(Debug, Deserialize)]
struct RawConcept {
    name: String,
    #[serde(rename = "type")]
    concept_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    source: String,
    target: String,
    #[serde(rename = "type")]
    relation_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Concepts in first-seen order, with repeats folded into the first sighting
#[derive(Default)]
struct ConceptList {
    items: Vec<Concept>,
    positions: HashMap<ConceptKey, usize>,
}

impl ConceptList {
    fn fold(&mut self, concept: Concept) {
        match self.positions.get(&concept.key) {
            Some(&i) => {
                self.items[i].absorb(&concept);
            }
            None => {
                self.positions.insert(concept.key.clone(), self.items.len());
                self.items.push(concept);
            }
        }
    }

    fn contains(&self, key: &ConceptKey) -> bool {
        self.positions.contains_key(key)
    }
}

fn type_names<T, const N: usize>(all: [T; N], name: impl Fn(&T) -> &'static str) -> Vec<&'static str> {
    all.iter().map(name).collect()
}

/// Validate a model reply against the extraction contract.
///
/// Every violation is reported, so a corrective retry can address all of
/// them at once. Concepts repeated in one reply are folded together,
/// self-referencing relationships are dropped and relationship endpoints
/// that were not listed as concepts are added as generic concepts.
pub fn parse_extraction(reply: &str) -> Result<ExtractionResult, String> {
    let raw: RawExtraction = parse_json(reply)?;
    let mut errors = Vec::new();

    let mut concepts = ConceptList::default();

    for (i, raw_concept) in raw.concepts.iter().enumerate() {
        if ConceptKey::new(&raw_concept.name).is_empty() {
            errors.push(format!("concepts[{}]: name is empty", i));
            continue;
        }
        let concept_type = match raw_concept.concept_type.parse::<ConceptType>() {
            Ok(t) => t,
            Err(e) => {
                errors.push(format!(
                    "concepts[{}]: {} (expected one of {})",
                    i,
                    e,
                    type_names(ConceptType::ALL, |t| t.as_str()).join(", ")
                ));
                continue;
            }
        };

        let concept = Concept::new(&raw_concept.name, concept_type)
            .with_description(raw_concept.description.as_deref().unwrap_or_default())
            .with_aliases(raw_concept.aliases.iter().map(String::as_str));
        concepts.fold(concept);
    }

    let mut relationships: Vec<Relationship> = Vec::new();
    let mut relationship_positions: HashMap<RelationshipKey, usize> = HashMap::new();
    let mut endpoints: Vec<String> = Vec::new();

    for (i, raw_rel) in raw.relationships.iter().enumerate() {
        let source = ConceptKey::new(&raw_rel.source);
        let target = ConceptKey::new(&raw_rel.target);
        if source.is_empty() || target.is_empty() {
            errors.push(format!("relationships[{}]: source and target are required", i));
            continue;
        }
        let relation_type = match raw_rel.relation_type.parse::<RelationType>() {
            Ok(t) => t,
            Err(e) => {
                errors.push(format!(
                    "relationships[{}]: {} (expected one of {})",
                    i,
                    e,
                    type_names(RelationType::ALL, |t| t.as_str()).join(", ")
                ));
                continue;
            }
        };
        let confidence = raw_rel.confidence.unwrap_or(DEFAULT_CONFIDENCE as f64);
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            errors.push(format!(
                "relationships[{}]: confidence {} is outside [0, 1]",
                i, confidence
            ));
            continue;
        }
        if source == target {
            debug!(concept = %source, "Dropping self-referencing relationship");
            continue;
        }

        let relationship = Relationship::new(source, target, relation_type)
            .with_description(raw_rel.description.as_deref().unwrap_or_default())
            .with_confidence(confidence as f32);
        match relationship_positions.get(&relationship.key()) {
            Some(&pos) => {
                relationships[pos].absorb(&relationship);
            }
            None => {
                relationship_positions.insert(relationship.key(), relationships.len());
                endpoints.push(raw_rel.source.clone());
                endpoints.push(raw_rel.target.clone());
                relationships.push(relationship);
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors.join("; "));
    }

    for name in endpoints {
        if !concepts.contains(&ConceptKey::new(&name)) {
            concepts.fold(Concept::new(&name, ConceptType::Concept));
        }
    }

    Ok(ExtractionResult {
        concepts: concepts.items,
        relationships,
    })
}

/// Language-model backed concept and relationship extractor
#[derive(Clone)]
pub struct Extractor {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl Extractor {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    /// JSON schema every extraction reply must satisfy
    pub fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["concepts", "relationships"],
            "properties": {
                "concepts": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name", "type"],
                        "properties": {
                            "name": { "type": "string" },
                            "type": {
                                "type": "string",
                                "enum": type_names(ConceptType::ALL, |t| t.as_str())
                            },
                            "description": { "type": "string" },
                            "aliases": { "type": "array", "items": { "type": "string" } }
                        }
                    }
                },
                "relationships": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["source", "target", "type"],
                        "properties": {
                            "source": { "type": "string" },
                            "target": { "type": "string" },
                            "type": {
                                "type": "string",
                                "enum": type_names(RelationType::ALL, |t| t.as_str())
                            },
                            "description": { "type": "string" },
                            "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
                        }
                    }
                }
            }
        })
    }

    fn request(chunk: &Chunk) -> ModelRequest {
        let prompt = format!(
            "Analyze the following text and extract:\n\
             1. Key concepts and entities mentioned in it\n\
             2. Directed relationships between these concepts\n\n\
             Concept types: {}\n\
             Relation types: {}\n\n\
             Use names as they appear in the text. Every relationship source and target \
             must be the name of a listed concept. Confidence is a number between 0 and 1.\n\n\
             Text:\n{}",
            type_names(ConceptType::ALL, |t| t.as_str()).join(", "),
            type_names(RelationType::ALL, |t| t.as_str()).join(", "),
            chunk.text.trim()
        );

        ModelRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt,
            schema: Self::schema(),
        }
    }

    /// Extract candidate facts from one chunk with a single bounded retry
    pub async fn extract(&self, chunk: &Chunk) -> Result<ExtractionResult, PipelineError> {
        let request = Self::request(chunk);
        match call_with_retry(self.model.as_ref(), &request, self.timeout, parse_extraction).await {
            Ok(result) => {
                info!(
                    chunk_id = %chunk.id,
                    concepts = result.concepts.len(),
                    relationships = result.relationships.len(),
                    "Extracted chunk"
                );
                Ok(result)
            }
            Err(failure) => {
                warn!(chunk_id = %chunk.id, reason = %failure.reason, "Extraction failed");
                Err(PipelineError::ExtractionValidation {
                    chunk_id: chunk.id,
                    attempts: failure.attempts,
                    reason: failure.reason,
                })
            }
        }
    }
}
