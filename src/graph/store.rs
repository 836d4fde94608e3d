use serde::{Deserialize, Serialize};

use crate::graph::{
    chunk::{Chunk, ChunkId, MentionEdge},
    concept::{Concept, ConceptKey},
    error::StoreError,
    relationship::{Relationship, RelationshipKey},
};

/// A unit of work against the graph store.
///
/// Reads observe the transaction's own staged writes. Nothing becomes
/// visible to other readers until [`GraphTransaction::commit`] succeeds;
/// dropping the transaction without committing discards every staged write.
pub trait GraphTransaction {
    fn concept(&self, key: &ConceptKey) -> Option<Concept>;

    /// Find a concept that lists `alias` among its surface forms
    fn concept_by_alias(&self, alias: &ConceptKey) -> Option<Concept>;

    /// Upsert keyed by the concept's canonical key
    fn put_concept(&mut self, concept: Concept);

    fn relationship(&self, key: &RelationshipKey) -> Option<Relationship>;

    /// Upsert keyed by (source, target, relation type)
    fn put_relationship(&mut self, relationship: Relationship);

    fn chunk(&self, id: &ChunkId) -> Option<Chunk>;

    fn put_chunk(&mut self, chunk: Chunk);

    fn has_mention(&self, mention: &MentionEdge) -> bool;

    fn put_mention(&mut self, mention: MentionEdge);

    /// Apply every staged write, or none of them
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// External graph store the pipeline reads from and merges into
pub trait GraphStore: Send + Sync {
    /// Start a transaction; transactions against one store are serialized
    fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>, StoreError>;

    /// All concepts, ordered by key
    fn concepts(&self) -> Result<Vec<Concept>, StoreError>;

    /// All chunks, ordered by (document id, sequence index)
    fn chunks(&self) -> Result<Vec<Chunk>, StoreError>;

    /// Chunks holding a mention edge to the concept, in chunk order
    fn chunks_mentioning(&self, key: &ConceptKey) -> Result<Vec<Chunk>, StoreError>;

    /// All relationships, ordered by key
    fn relationships(&self) -> Result<Vec<Relationship>, StoreError>;

    fn mention_count(&self, key: &ConceptKey) -> Result<usize, StoreError>;

    fn stats(&self) -> Result<GraphStats, StoreError>;
}

/// Node and edge counts of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub chunks: usize,
    pub concepts: usize,
    pub relationships: usize,
    pub mentions: usize,
}
