pub mod answerer;
pub mod chunker;
pub mod config;
pub mod contract;
pub mod error;
pub mod external;
pub mod extractor;
pub mod graph;
pub mod merger;
pub mod parser;
pub mod pipeline;
pub mod retriever;
pub mod source;

pub use answerer::{Answer, Answerer};
pub use chunker::Chunker;
pub use config::Config;
pub use error::PipelineError;
pub use external::{ExternalError, LLMConfig, LanguageModel, ModelRequest, OllamaClient};
pub use extractor::{ExtractionResult, Extractor};
pub use graph::{
    Chunk, ChunkId, Concept, ConceptKey, ConceptType, GraphStore, MemoryGraphStore, RelationType,
    Relationship, StoreError,
};
pub use merger::{GraphMerger, MergeReport, SkippedChunk};
pub use parser::parse_markdown;
pub use pipeline::{KnowledgePipeline, PipelineSettings};
pub use retriever::{Retrieval, Retriever, ScoredChunk};
pub use source::{collect_documents, Document, LocalSource};
