use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::extractor::ExtractionResult;
use crate::graph::{
    Chunk, ChunkId, Concept, ConceptKey, ConceptType, GraphStore, GraphTransaction, MentionEdge,
    StoreError,
};

/// A chunk left out of the graph, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedChunk {
    pub chunk_id: ChunkId,
    pub sequence_index: usize,
    pub reason: String,
}

/// Outcome of merging one chunk, or of a whole ingestion run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub chunks_total: usize,
    pub chunks_merged: usize,
    pub concepts_created: usize,
    /// Existing concepts whose aliases, description or type changed
    pub concepts_updated: usize,
    pub relationships_created: usize,
    /// Observations folded into an existing relationship
    pub relationships_merged: usize,
    pub mentions_created: usize,
    pub skipped: Vec<SkippedChunk>,
    pub cancelled: bool,
}

impl MergeReport {
    /// Add the counts of another report to this one
    pub fn absorb(&mut self, other: MergeReport) {
        self.chunks_total += other.chunks_total;
        self.chunks_merged += other.chunks_merged;
        self.concepts_created += other.concepts_created;
        self.concepts_updated += other.concepts_updated;
        self.relationships_created += other.relationships_created;
        self.relationships_merged += other.relationships_merged;
        self.mentions_created += other.mentions_created;
        self.skipped.extend(other.skipped);
        self.cancelled |= other.cancelled;
    }

    pub fn record_skip(&mut self, chunk: &Chunk, reason: String) {
        self.skipped.push(SkippedChunk {
            chunk_id: chunk.id,
            sequence_index: chunk.sequence_index,
            reason,
        });
    }

    /// Every chunk made it into the graph
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && !self.cancelled && self.chunks_merged == self.chunks_total
    }
}

/// Upserts extracted facts into the graph store, one transaction per chunk
#[derive(Clone)]
pub struct GraphMerger {
    store: Arc<dyn GraphStore>,
}

impl GraphMerger {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Merge one chunk's extraction into the graph.
    ///
    /// All writes for the chunk are committed together or not at all; a
    /// store failure surfaces as `MergeFailed` and the chunk can be retried.
    /// A stored chunk at the same position with different text or span is
    /// left alone and reported as `ChunkConflict`, since mentions must only
    /// point at the text they were extracted from.
    pub fn merge(
        &self,
        document_id: &str,
        chunk: &Chunk,
        result: &ExtractionResult,
    ) -> Result<MergeReport, PipelineError> {
        let failed = |source: StoreError| PipelineError::MergeFailed {
            chunk_id: chunk.id,
            source,
        };

        let mut tx = self.store.begin().map_err(failed)?;
        let mut report = MergeReport {
            chunks_total: 1,
            chunks_merged: 1,
            ..MergeReport::default()
        };

        match tx.chunk(&chunk.id) {
            Some(stored) if stored.text != chunk.text || stored.span != chunk.span => {
                return Err(PipelineError::ChunkConflict {
                    chunk_id: chunk.id,
                    document_id: document_id.to_string(),
                    sequence_index: chunk.sequence_index,
                });
            }
            Some(_) => {}
            None => tx.put_chunk(chunk.clone()),
        }

        let mut resolved: HashMap<ConceptKey, ConceptKey> = HashMap::new();
        for concept in &result.concepts {
            let stored = resolve_concept(tx.as_mut(), concept, &mut report);
            record_mention(tx.as_mut(), chunk.id, &stored, &mut report);
            resolved.insert(concept.key.clone(), stored);
        }

        for relationship in &result.relationships {
            let mut relationship = relationship.clone();
            for endpoint in [&mut relationship.source, &mut relationship.target] {
                let stored = match resolved.get(endpoint) {
                    Some(stored) => stored.clone(),
                    None => {
                        let implied = Concept::new(endpoint.as_str(), ConceptType::Concept);
                        let stored = resolve_concept(tx.as_mut(), &implied, &mut report);
                        record_mention(tx.as_mut(), chunk.id, &stored, &mut report);
                        resolved.insert(endpoint.clone(), stored.clone());
                        stored
                    }
                };
                *endpoint = stored;
            }

            if relationship.source == relationship.target {
                debug!(concept = %relationship.source, "Endpoints resolved to one concept");
                continue;
            }

            match tx.relationship(&relationship.key()) {
                Some(mut existing) => {
                    if existing.absorb(&relationship) {
                        tx.put_relationship(existing);
                    }
                    report.relationships_merged += 1;
                }
                None => {
                    tx.put_relationship(relationship);
                    report.relationships_created += 1;
                }
            }
        }

        tx.commit().map_err(failed)?;

        info!(
            document_id,
            chunk_id = %chunk.id,
            concepts_created = report.concepts_created,
            concepts_updated = report.concepts_updated,
            relationships_created = report.relationships_created,
            relationships_merged = report.relationships_merged,
            "Merged chunk"
        );
        Ok(report)
    }
}

/// Find the stored concept a candidate refers to, updating or creating it.
///
/// Lookup order: canonical key, then the candidate's aliases as canonical
/// keys, then the candidate's key as a known alias.
fn resolve_concept(
    tx: &mut (dyn GraphTransaction + '_),
    concept: &Concept,
    report: &mut MergeReport,
) -> ConceptKey {
    let existing = tx
        .concept(&concept.key)
        .or_else(|| concept.alias_keys().find_map(|alias| tx.concept(&alias)))
        .or_else(|| tx.concept_by_alias(&concept.key));

    match existing {
        Some(mut stored) => {
            if stored.absorb(concept) {
                report.concepts_updated += 1;
                tx.put_concept(stored.clone());
            }
            stored.key
        }
        None => {
            report.concepts_created += 1;
            tx.put_concept(concept.clone());
            concept.key.clone()
        }
    }
}

fn record_mention(
    tx: &mut (dyn GraphTransaction + '_),
    chunk_id: ChunkId,
    concept: &ConceptKey,
    report: &mut MergeReport,
) {
    let mention = MentionEdge::new(chunk_id, concept.clone());
    if !tx.has_mention(&mention) {
        tx.put_mention(mention);
        report.mentions_created += 1;
    }
}
