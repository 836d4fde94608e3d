use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::graph::concept::ConceptKey;

/// Namespace used to derive chunk identifiers from their document position
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x3f6c_1d2a_8e4b_4c9f_a1b7_55d0_c2e8_9a41);

/// Stable identifier of a chunk, derived from `(document_id, sequence_index)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(Uuid);

impl ChunkId {
    /// Derive the identifier for the chunk at `sequence_index` of a document.
    ///
    /// The same position always yields the same id, so re-ingesting a
    /// document addresses the chunks it already produced.
    pub fn derive(document_id: &str, sequence_index: usize) -> Self {
        let name = format!("{}\u{1f}{}", document_id, sequence_index);
        Self(Uuid::new_v5(&CHUNK_NAMESPACE, name.as_bytes()))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChunkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Byte range of a chunk within its source document.
///
/// Offsets always fall on UTF-8 character boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharSpan {
    pub start: usize,
    pub end: usize,
}

impl CharSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A bounded unit of document text used for extraction and retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: String,
    pub sequence_index: usize,
    pub text: String,
    pub span: CharSpan,
}

impl Chunk {
    pub fn new(document_id: &str, sequence_index: usize, text: String, span: CharSpan) -> Self {
        Self {
            id: ChunkId::derive(document_id, sequence_index),
            document_id: document_id.to_string(),
            sequence_index,
            text,
            span,
        }
    }

    /// Ordering used wherever chunks need a reproducible order
    pub fn position(&self) -> (&str, usize) {
        (&self.document_id, self.sequence_index)
    }
}

/// Evidence link from a chunk to a concept it mentions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MentionEdge {
    pub chunk_id: ChunkId,
    pub concept: ConceptKey,
}

impl MentionEdge {
    pub fn new(chunk_id: ChunkId, concept: ConceptKey) -> Self {
        Self { chunk_id, concept }
    }
}
