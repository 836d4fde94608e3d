use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::graph::{
    concept::{ConceptKey, ConceptType},
    error::StoreError,
    relationship::RelationType,
    store::GraphStore,
};

/// Concept as exposed to visualisation or downstream tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedConcept {
    pub id: ConceptKey,
    pub label: String,
    #[serde(rename = "type")]
    pub concept_type: ConceptType,
    pub description: String,
    pub aliases: Vec<String>,
    pub mentions_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedRelationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    pub description: String,
    pub confidence: f32,
}

/// Node/edge listing of the whole concept graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphExport {
    pub nodes: Vec<ExportedConcept>,
    pub edges: Vec<ExportedRelationship>,
}

/// Collect every concept and relationship, labelled with display names
pub fn export_graph(store: &dyn GraphStore) -> Result<GraphExport, StoreError> {
    let concepts = store.concepts()?;
    let labels: HashMap<ConceptKey, String> = concepts
        .iter()
        .map(|c| (c.key.clone(), c.canonical_name.clone()))
        .collect();
    let label_of = |key: &ConceptKey| {
        labels
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    };

    let mut nodes = Vec::with_capacity(concepts.len());
    for concept in &concepts {
        nodes.push(ExportedConcept {
            id: concept.key.clone(),
            label: concept.canonical_name.clone(),
            concept_type: concept.concept_type,
            description: concept.description.clone(),
            aliases: concept.aliases.iter().cloned().collect(),
            mentions_count: store.mention_count(&concept.key)?,
        });
    }

    let edges = store
        .relationships()?
        .into_iter()
        .map(|r| ExportedRelationship {
            source: label_of(&r.source),
            target: label_of(&r.target),
            relation_type: r.relation_type,
            description: r.description,
            confidence: r.confidence,
        })
        .collect();

    Ok(GraphExport { nodes, edges })
}
