pub mod chunk;
pub mod concept;
pub mod error;
pub mod export;
pub mod memory;
pub mod relationship;
pub mod store;

pub use chunk::{CharSpan, Chunk, ChunkId, MentionEdge};
pub use concept::{Concept, ConceptKey, ConceptType};
pub use error::StoreError;
pub use export::{export_graph, GraphExport};
pub use memory::MemoryGraphStore;
pub use relationship::{RelationType, Relationship, RelationshipKey, DEFAULT_CONFIDENCE};
pub use store::{GraphStats, GraphStore, GraphTransaction};
