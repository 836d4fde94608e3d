use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Graph store lock poisoned")]
    Poisoned,

    #[error("Relationship {0} references a concept missing from the store")]
    DanglingRelationship(String),

    #[error("Mention of '{concept}' by chunk {chunk_id} references a missing node")]
    DanglingMention { chunk_id: String, concept: String },

    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot format error: {0}")]
    Serialization(#[from] serde_json::Error),
}
