use thiserror::Error;

use crate::external::ExternalError;
use crate::graph::{ChunkId, StoreError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Document '{document_id}' is empty")]
    EmptyDocument { document_id: String },

    #[error("Extraction failed for chunk {chunk_id} after {attempts} attempts: {reason}")]
    ExtractionValidation {
        chunk_id: ChunkId,
        attempts: usize,
        reason: String,
    },

    #[error("Merge failed for chunk {chunk_id}: {source}")]
    MergeFailed {
        chunk_id: ChunkId,
        #[source]
        source: StoreError,
    },

    #[error(
        "Chunk {sequence_index} of '{document_id}' no longer matches the stored text; \
         clear the graph or ingest the new version under another document id"
    )]
    ChunkConflict {
        chunk_id: ChunkId,
        document_id: String,
        sequence_index: usize,
    },

    #[error("Insufficient information: no relevant context was found for the question")]
    NoContext,

    #[error("Answer generation failed after {attempts} attempts: {reason}")]
    AnswerUnavailable { attempts: usize, reason: String },

    #[error("Invalid chunking parameters: {0}")]
    InvalidChunking(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    External(#[from] ExternalError),
}

impl PipelineError {
    /// Whether a question should be reported as unanswerable rather than failed
    pub fn is_insufficient_information(&self) -> bool {
        matches!(
            self,
            PipelineError::NoContext | PipelineError::AnswerUnavailable { .. }
        )
    }
}
