use petgraph::{
    graph::{DiGraph, EdgeIndex, NodeIndex},
    visit::EdgeRef,
    Direction,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::graph::{
    chunk::{Chunk, ChunkId, MentionEdge},
    concept::{Concept, ConceptKey},
    error::StoreError,
    relationship::{Relationship, RelationshipKey},
    store::{GraphStats, GraphStore, GraphTransaction},
};

#[derive(Debug, Clone)]
enum GraphNode {
    Chunk(Chunk),
    Concept(Concept),
}

#[derive(Debug, Clone)]
enum GraphEdge {
    /// chunk -> concept
    Mentions,
    /// concept -> concept
    Relates(Relationship),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeKey {
    Chunk(ChunkId),
    Concept(ConceptKey),
}

/// On-disk form of the graph
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    chunks: Vec<Chunk>,
    concepts: Vec<Concept>,
    relationships: Vec<Relationship>,
    mentions: Vec<MentionEdge>,
}

/// The committed graph
#[derive(Default)]
struct GraphState {
    graph: DiGraph<GraphNode, GraphEdge>,
    /// Mapping from node key to node index for quick lookups
    node_map: HashMap<NodeKey, NodeIndex>,
    /// Alias key -> smallest concept key claiming it, so ownership does not
    /// depend on commit or load order
    alias_index: BTreeMap<ConceptKey, ConceptKey>,
}

impl GraphState {
    fn from_snapshot(snapshot: Snapshot) -> Result<Self, StoreError> {
        let mut state = Self::default();
        for chunk in snapshot.chunks {
            state.upsert_chunk(chunk);
        }
        for concept in snapshot.concepts {
            state.upsert_concept(concept);
        }
        for relationship in snapshot.relationships {
            state.upsert_relationship(relationship)?;
        }
        for mention in &snapshot.mentions {
            state.add_mention(mention)?;
        }
        Ok(state)
    }

    fn snapshot(&self) -> Snapshot {
        let mut mentions: Vec<MentionEdge> = self
            .graph
            .edge_references()
            .filter(|e| matches!(e.weight(), GraphEdge::Mentions))
            .filter_map(|e| match (&self.graph[e.source()], &self.graph[e.target()]) {
                (GraphNode::Chunk(chunk), GraphNode::Concept(concept)) => {
                    Some(MentionEdge::new(chunk.id, concept.key.clone()))
                }
                _ => None,
            })
            .collect();
        mentions.sort();

        Snapshot {
            chunks: self.chunks(),
            concepts: self.concepts(),
            relationships: self.relationships(),
            mentions,
        }
    }

    fn concept_index(&self, key: &ConceptKey) -> Option<NodeIndex> {
        self.node_map.get(&NodeKey::Concept(key.clone())).copied()
    }

    fn chunk_index(&self, id: &ChunkId) -> Option<NodeIndex> {
        self.node_map.get(&NodeKey::Chunk(*id)).copied()
    }

    fn concept(&self, key: &ConceptKey) -> Option<&Concept> {
        self.concept_index(key).and_then(|idx| match &self.graph[idx] {
            GraphNode::Concept(concept) => Some(concept),
            GraphNode::Chunk(_) => None,
        })
    }

    fn concept_by_alias(&self, alias: &ConceptKey) -> Option<&Concept> {
        self.alias_index.get(alias).and_then(|key| self.concept(key))
    }

    fn chunk(&self, id: &ChunkId) -> Option<&Chunk> {
        self.chunk_index(id).and_then(|idx| match &self.graph[idx] {
            GraphNode::Chunk(chunk) => Some(chunk),
            GraphNode::Concept(_) => None,
        })
    }

    fn has_chunk(&self, id: &ChunkId) -> bool {
        self.chunk_index(id).is_some()
    }

    fn upsert_node(&mut self, key: NodeKey, node: GraphNode) -> NodeIndex {
        match self.node_map.get(&key) {
            Some(&idx) => {
                self.graph[idx] = node;
                idx
            }
            None => {
                let idx = self.graph.add_node(node);
                self.node_map.insert(key, idx);
                idx
            }
        }
    }

    fn upsert_chunk(&mut self, chunk: Chunk) {
        self.upsert_node(NodeKey::Chunk(chunk.id), GraphNode::Chunk(chunk));
    }

    fn upsert_concept(&mut self, concept: Concept) {
        for alias in concept.alias_keys() {
            self.alias_index
                .entry(alias)
                .and_modify(|owner| {
                    if concept.key < *owner {
                        *owner = concept.key.clone();
                    }
                })
                .or_insert_with(|| concept.key.clone());
        }
        self.upsert_node(
            NodeKey::Concept(concept.key.clone()),
            GraphNode::Concept(concept),
        );
    }

    fn relation_edge(&self, key: &RelationshipKey) -> Option<EdgeIndex> {
        let from = self.concept_index(&key.source)?;
        let to = self.concept_index(&key.target)?;
        self.graph
            .edges_connecting(from, to)
            .find(|e| {
                matches!(e.weight(), GraphEdge::Relates(r) if r.relation_type == key.relation_type)
            })
            .map(|e| e.id())
    }

    fn relationship(&self, key: &RelationshipKey) -> Option<&Relationship> {
        self.relation_edge(key).and_then(|idx| match &self.graph[idx] {
            GraphEdge::Relates(relationship) => Some(relationship),
            GraphEdge::Mentions => None,
        })
    }

    fn upsert_relationship(&mut self, relationship: Relationship) -> Result<(), StoreError> {
        let key = relationship.key();
        if let Some(idx) = self.relation_edge(&key) {
            self.graph[idx] = GraphEdge::Relates(relationship);
            return Ok(());
        }

        match (
            self.concept_index(&key.source),
            self.concept_index(&key.target),
        ) {
            (Some(from), Some(to)) => {
                self.graph
                    .add_edge(from, to, GraphEdge::Relates(relationship));
                Ok(())
            }
            _ => Err(StoreError::DanglingRelationship(key.to_string())),
        }
    }

    fn has_mention(&self, mention: &MentionEdge) -> bool {
        match (
            self.chunk_index(&mention.chunk_id),
            self.concept_index(&mention.concept),
        ) {
            (Some(from), Some(to)) => self
                .graph
                .edges_connecting(from, to)
                .any(|e| matches!(e.weight(), GraphEdge::Mentions)),
            _ => false,
        }
    }

    fn add_mention(&mut self, mention: &MentionEdge) -> Result<(), StoreError> {
        if self.has_mention(mention) {
            return Ok(());
        }

        match (
            self.chunk_index(&mention.chunk_id),
            self.concept_index(&mention.concept),
        ) {
            (Some(from), Some(to)) => {
                self.graph.add_edge(from, to, GraphEdge::Mentions);
                Ok(())
            }
            _ => Err(StoreError::DanglingMention {
                chunk_id: mention.chunk_id.to_string(),
                concept: mention.concept.to_string(),
            }),
        }
    }

    fn concepts(&self) -> Vec<Concept> {
        let mut concepts: Vec<Concept> = self
            .graph
            .node_weights()
            .filter_map(|node| match node {
                GraphNode::Concept(concept) => Some(concept.clone()),
                GraphNode::Chunk(_) => None,
            })
            .collect();
        concepts.sort_by(|a, b| a.key.cmp(&b.key));
        concepts
    }

    fn chunks(&self) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = self
            .graph
            .node_weights()
            .filter_map(|node| match node {
                GraphNode::Chunk(chunk) => Some(chunk.clone()),
                GraphNode::Concept(_) => None,
            })
            .collect();
        chunks.sort_by(|a, b| a.position().cmp(&b.position()));
        chunks
    }

    fn chunks_mentioning(&self, key: &ConceptKey) -> Vec<Chunk> {
        let Some(idx) = self.concept_index(key) else {
            return Vec::new();
        };

        let mut chunks: Vec<Chunk> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .filter(|e| matches!(e.weight(), GraphEdge::Mentions))
            .filter_map(|e| match &self.graph[e.source()] {
                GraphNode::Chunk(chunk) => Some(chunk.clone()),
                GraphNode::Concept(_) => None,
            })
            .collect();
        chunks.sort_by(|a, b| a.position().cmp(&b.position()));
        chunks
    }

    fn relationships(&self) -> Vec<Relationship> {
        let mut relationships: Vec<Relationship> = self
            .graph
            .edge_weights()
            .filter_map(|edge| match edge {
                GraphEdge::Relates(relationship) => Some(relationship.clone()),
                GraphEdge::Mentions => None,
            })
            .collect();
        relationships.sort_by_key(|r| r.key());
        relationships
    }

    fn mention_count(&self, key: &ConceptKey) -> usize {
        self.concept_index(key)
            .map(|idx| {
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .filter(|e| matches!(e.weight(), GraphEdge::Mentions))
                    .count()
            })
            .unwrap_or(0)
    }

    fn stats(&self) -> GraphStats {
        let mut stats = GraphStats::default();
        for node in self.graph.node_weights() {
            match node {
                GraphNode::Chunk(_) => stats.chunks += 1,
                GraphNode::Concept(_) => stats.concepts += 1,
            }
        }
        for edge in self.graph.edge_weights() {
            match edge {
                GraphEdge::Mentions => stats.mentions += 1,
                GraphEdge::Relates(_) => stats.relationships += 1,
            }
        }
        stats
    }
}

/// Writes staged by an open transaction
#[derive(Default)]
struct Staged {
    chunks: BTreeMap<ChunkId, Chunk>,
    concepts: BTreeMap<ConceptKey, Concept>,
    relationships: BTreeMap<RelationshipKey, Relationship>,
    mentions: BTreeSet<MentionEdge>,
}

impl Staged {
    /// Reject the whole batch if any edge would dangle after commit
    fn validate(&self, state: &GraphState) -> Result<(), StoreError> {
        let concept_exists =
            |key: &ConceptKey| self.concepts.contains_key(key) || state.concept(key).is_some();

        for key in self.relationships.keys() {
            if !concept_exists(&key.source) || !concept_exists(&key.target) {
                return Err(StoreError::DanglingRelationship(key.to_string()));
            }
        }

        for mention in &self.mentions {
            let chunk_exists =
                self.chunks.contains_key(&mention.chunk_id) || state.has_chunk(&mention.chunk_id);
            if !chunk_exists || !concept_exists(&mention.concept) {
                return Err(StoreError::DanglingMention {
                    chunk_id: mention.chunk_id.to_string(),
                    concept: mention.concept.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Transaction holding the store lock for its whole lifetime
pub struct MemoryTransaction<'a> {
    state: MutexGuard<'a, GraphState>,
    staged: Staged,
}

impl GraphTransaction for MemoryTransaction<'_> {
    fn concept(&self, key: &ConceptKey) -> Option<Concept> {
        self.staged
            .concepts
            .get(key)
            .or_else(|| self.state.concept(key))
            .cloned()
    }

    fn concept_by_alias(&self, alias: &ConceptKey) -> Option<Concept> {
        let staged = self
            .staged
            .concepts
            .values()
            .find(|c| c.alias_keys().any(|k| k == *alias));
        let committed = self
            .state
            .concept_by_alias(alias)
            .map(|committed| self.staged.concepts.get(&committed.key).unwrap_or(committed));

        staged
            .into_iter()
            .chain(committed)
            .min_by(|a, b| a.key.cmp(&b.key))
            .cloned()
    }

    fn put_concept(&mut self, concept: Concept) {
        self.staged.concepts.insert(concept.key.clone(), concept);
    }

    fn relationship(&self, key: &RelationshipKey) -> Option<Relationship> {
        self.staged
            .relationships
            .get(key)
            .or_else(|| self.state.relationship(key))
            .cloned()
    }

    fn put_relationship(&mut self, relationship: Relationship) {
        self.staged
            .relationships
            .insert(relationship.key(), relationship);
    }

    fn chunk(&self, id: &ChunkId) -> Option<Chunk> {
        self.staged
            .chunks
            .get(id)
            .or_else(|| self.state.chunk(id))
            .cloned()
    }

    fn put_chunk(&mut self, chunk: Chunk) {
        self.staged.chunks.insert(chunk.id, chunk);
    }

    fn has_mention(&self, mention: &MentionEdge) -> bool {
        self.staged.mentions.contains(mention) || self.state.has_mention(mention)
    }

    fn put_mention(&mut self, mention: MentionEdge) {
        self.staged.mentions.insert(mention);
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { mut state, staged } = *self;
        staged.validate(&state)?;

        debug!(
            chunks = staged.chunks.len(),
            concepts = staged.concepts.len(),
            relationships = staged.relationships.len(),
            mentions = staged.mentions.len(),
            "Committing graph transaction"
        );

        for chunk in staged.chunks.into_values() {
            state.upsert_chunk(chunk);
        }
        for concept in staged.concepts.into_values() {
            state.upsert_concept(concept);
        }
        for relationship in staged.relationships.into_values() {
            state.upsert_relationship(relationship)?;
        }
        for mention in &staged.mentions {
            state.add_mention(mention)?;
        }
        Ok(())
    }
}

/// In-process graph store backed by a petgraph directed graph.
///
/// Optionally bound to a JSON snapshot file so the graph accumulates
/// across runs.
pub struct MemoryGraphStore {
    state: Mutex<GraphState>,
    path: Option<PathBuf>,
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraphStore {
    /// Create a new empty store that lives only in memory
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GraphState::default()),
            path: None,
        }
    }

    /// Open a store bound to a snapshot file, loading it if it exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            GraphState::from_snapshot(snapshot)?
        } else {
            GraphState::default()
        };

        let stats = state.stats();
        info!(
            path = %path.display(),
            chunks = stats.chunks,
            concepts = stats.concepts,
            relationships = stats.relationships,
            "Opened graph store"
        );

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the committed graph to the bound snapshot file, if any
    pub fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let snapshot = self.lock()?.snapshot();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Persisted graph snapshot");
        Ok(())
    }

    /// Remove every node and edge
    pub fn clear(&self) -> Result<(), StoreError> {
        *self.lock()? = GraphState::default();
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, GraphState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl GraphStore for MemoryGraphStore {
    fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            state: self.lock()?,
            staged: Staged::default(),
        }))
    }

    fn concepts(&self) -> Result<Vec<Concept>, StoreError> {
        Ok(self.lock()?.concepts())
    }

    fn chunks(&self) -> Result<Vec<Chunk>, StoreError> {
        Ok(self.lock()?.chunks())
    }

    fn chunks_mentioning(&self, key: &ConceptKey) -> Result<Vec<Chunk>, StoreError> {
        Ok(self.lock()?.chunks_mentioning(key))
    }

    fn relationships(&self) -> Result<Vec<Relationship>, StoreError> {
        Ok(self.lock()?.relationships())
    }

    fn mention_count(&self, key: &ConceptKey) -> Result<usize, StoreError> {
        Ok(self.lock()?.mention_count(key))
    }

    fn stats(&self) -> Result<GraphStats, StoreError> {
        Ok(self.lock()?.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{
        chunk::CharSpan,
        concept::ConceptType,
        relationship::RelationType,
    };

    fn create_test_chunk(index: usize, text: &str) -> Chunk {
        Chunk::new("doc", index, text.to_string(), CharSpan::new(0, text.len()))
    }

    fn capital_of() -> Relationship {
        Relationship::new(
            ConceptKey::new("Paris"),
            ConceptKey::new("France"),
            RelationType::CapitalOf,
        )
    }

    #[test]
    fn test_store_creation() {
        let store = MemoryGraphStore::new();
        assert_eq!(store.stats().unwrap(), GraphStats::default());
        assert!(store.path().is_none());
    }

    #[test]
    fn test_commit_makes_writes_visible() {
        let store = MemoryGraphStore::new();
        let chunk = create_test_chunk(0, "Paris is the capital of France.");
        let chunk_id = chunk.id;

        let mut tx = store.begin().unwrap();
        tx.put_chunk(chunk);
        tx.put_concept(Concept::new("Paris", ConceptType::Location));
        tx.put_concept(Concept::new("France", ConceptType::Location));
        tx.put_relationship(capital_of());
        tx.put_mention(MentionEdge::new(chunk_id, ConceptKey::new("Paris")));
        assert!(tx.concept(&ConceptKey::new("paris")).is_some());
        tx.commit().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.concepts, 2);
        assert_eq!(stats.relationships, 1);
        assert_eq!(stats.mentions, 1);
        assert_eq!(
            store.chunks_mentioning(&ConceptKey::new("Paris")).unwrap()[0].id,
            chunk_id
        );
    }

    #[test]
    fn test_dropped_transaction_discards_writes() {
        let store = MemoryGraphStore::new();
        {
            let mut tx = store.begin().unwrap();
            tx.put_concept(Concept::new("Paris", ConceptType::Location));
        }
        assert!(store.concepts().unwrap().is_empty());
    }

    #[test]
    fn test_dangling_relationship_rejects_whole_batch() {
        let store = MemoryGraphStore::new();

        let mut tx = store.begin().unwrap();
        tx.put_concept(Concept::new("Paris", ConceptType::Location));
        tx.put_relationship(capital_of());
        assert!(matches!(
            tx.commit(),
            Err(StoreError::DanglingRelationship(_))
        ));

        assert!(store.concepts().unwrap().is_empty());
    }

    #[test]
    fn test_upserts_do_not_duplicate() {
        let store = MemoryGraphStore::new();
        let chunk = create_test_chunk(0, "Paris");
        let mention = MentionEdge::new(chunk.id, ConceptKey::new("Paris"));

        for confidence in [0.4, 0.9] {
            let mut tx = store.begin().unwrap();
            tx.put_chunk(chunk.clone());
            tx.put_concept(Concept::new("Paris", ConceptType::Location));
            tx.put_concept(Concept::new("France", ConceptType::Location));
            tx.put_relationship(capital_of().with_confidence(confidence));
            tx.put_mention(mention.clone());
            tx.commit().unwrap();
        }

        let stats = store.stats().unwrap();
        assert_eq!(stats.concepts, 2);
        assert_eq!(stats.relationships, 1);
        assert_eq!(stats.mentions, 1);
        assert_eq!(store.relationships().unwrap()[0].confidence, 0.9);
        assert_eq!(store.mention_count(&ConceptKey::new("Paris")).unwrap(), 1);
    }

    #[test]
    fn test_alias_lookup() {
        let store = MemoryGraphStore::new();
        let mut tx = store.begin().unwrap();
        tx.put_concept(
            Concept::new("Paris", ConceptType::Location).with_aliases(["City of Light"]),
        );
        tx.commit().unwrap();

        let tx = store.begin().unwrap();
        let found = tx.concept_by_alias(&ConceptKey::new("city of  light")).unwrap();
        assert_eq!(found.canonical_name, "Paris");
        assert!(tx.concept_by_alias(&ConceptKey::new("paris")).is_none());
    }

    #[test]
    fn test_shared_alias_has_a_stable_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let store = MemoryGraphStore::open(&path).unwrap();

        // the later key claims the alias first
        for name in ["Zurich", "Bern"] {
            let mut tx = store.begin().unwrap();
            tx.put_concept(Concept::new(name, ConceptType::Location).with_aliases(["Swiss City"]));
            tx.commit().unwrap();
        }
        let alias = ConceptKey::new("swiss city");
        let owner = store.begin().unwrap().concept_by_alias(&alias).unwrap();
        assert_eq!(owner.canonical_name, "Bern");

        store.persist().unwrap();
        let reopened = MemoryGraphStore::open(&path).unwrap();
        let owner = reopened.begin().unwrap().concept_by_alias(&alias).unwrap();
        assert_eq!(owner.canonical_name, "Bern");
    }

    #[test]
    fn test_transaction_reads_stored_chunk() {
        let store = MemoryGraphStore::new();
        let chunk = create_test_chunk(0, "Paris is lovely.");

        let mut tx = store.begin().unwrap();
        assert!(tx.chunk(&chunk.id).is_none());
        tx.put_chunk(chunk.clone());
        assert_eq!(tx.chunk(&chunk.id), Some(chunk.clone()));
        tx.commit().unwrap();

        let tx = store.begin().unwrap();
        assert_eq!(tx.chunk(&chunk.id).map(|c| c.text), Some("Paris is lovely.".to_string()));
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let chunk = create_test_chunk(0, "Paris is the capital of France.");

        let store = MemoryGraphStore::open(&path).unwrap();
        let mut tx = store.begin().unwrap();
        tx.put_chunk(chunk.clone());
        tx.put_concept(Concept::new("Paris", ConceptType::Location));
        tx.put_concept(Concept::new("France", ConceptType::Location));
        tx.put_relationship(capital_of());
        tx.put_mention(MentionEdge::new(chunk.id, ConceptKey::new("France")));
        tx.commit().unwrap();
        store.persist().unwrap();

        let reopened = MemoryGraphStore::open(&path).unwrap();
        assert_eq!(reopened.stats().unwrap(), store.stats().unwrap());
        assert_eq!(reopened.chunks().unwrap(), vec![chunk]);

        reopened.clear().unwrap();
        assert_eq!(reopened.stats().unwrap(), GraphStats::default());
    }
}
