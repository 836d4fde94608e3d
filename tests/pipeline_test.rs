use async_trait::async_trait;
use knowledge_graph_builder::graph::{GraphStats, GraphTransaction, RelationshipKey};
use knowledge_graph_builder::{
    Chunk, ChunkId, Concept, ConceptKey, ExternalError, GraphStore, KnowledgePipeline,
    LanguageModel, MemoryGraphStore, ModelRequest, PipelineError, PipelineSettings, RelationType,
    Relationship, Retriever, StoreError,
};
use regex::Regex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const PARIS_TEXT: &str = "Paris is the capital of France. The Eiffel Tower is in Paris.";

const PARIS_EXTRACTION: &str = r#"{
    "concepts": [
        {"name": "Paris", "type": "location", "description": "Capital city of France"},
        {"name": "France", "type": "location"},
        {"name": "Eiffel Tower", "type": "location"}
    ],
    "relationships": [
        {"source": "Paris", "target": "France", "type": "capital_of", "confidence": 0.95},
        {"source": "Eiffel Tower", "target": "Paris", "type": "located_in", "confidence": 0.9}
    ]
}"#;

const BERLIN_EXTRACTION: &str = r#"{
    "concepts": [{"name": "Berlin", "type": "location"}],
    "relationships": []
}"#;

const EMPTY_EXTRACTION: &str = r#"{"concepts": [], "relationships": []}"#;

/// Deterministic stand-in for the language model service
#[derive(Default)]
struct FixtureModel {
    calls: AtomicUsize,
}

impl FixtureModel {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn extraction(prompt: &str) -> String {
        if prompt.contains("broken") {
            "I could not find anything useful.".to_string()
        } else if prompt.contains("Paris") {
            PARIS_EXTRACTION.to_string()
        } else if prompt.contains("Berlin") {
            BERLIN_EXTRACTION.to_string()
        } else {
            EMPTY_EXTRACTION.to_string()
        }
    }

    /// Cite the context chunk that mentions the capital, plus one bogus id
    fn answer(prompt: &str) -> String {
        let tagged = Regex::new(r"\[chunk ([0-9a-f-]+)\]\n([^\n]*)").unwrap();
        let cited: Vec<String> = tagged
            .captures_iter(prompt)
            .filter(|caps| caps[2].contains("capital of France"))
            .map(|caps| caps[1].to_string())
            .collect();

        serde_json::json!({
            "answer": "Paris is the capital of France.",
            "citations": cited.into_iter().chain(["chunk-999".to_string()]).collect::<Vec<_>>()
        })
        .to_string()
    }
}

#[async_trait]
impl LanguageModel for FixtureModel {
    async fn complete(&self, request: &ModelRequest) -> Result<String, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.schema["properties"].get("answer").is_some() {
            Ok(Self::answer(&request.prompt))
        } else {
            Ok(Self::extraction(&request.prompt))
        }
    }
}

/// Model whose calls never complete
struct StalledModel;

#[async_trait]
impl LanguageModel for StalledModel {
    async fn complete(&self, _request: &ModelRequest) -> Result<String, ExternalError> {
        std::future::pending().await
    }
}

/// Store that refuses to start the transactions numbered in `failing`
struct FlakyStore {
    inner: MemoryGraphStore,
    begins: AtomicUsize,
    failing: Vec<usize>,
}

impl FlakyStore {
    fn failing_first(failures: usize) -> Self {
        Self::failing_calls(&(0..failures).collect::<Vec<_>>())
    }

    fn failing_calls(calls: &[usize]) -> Self {
        Self {
            inner: MemoryGraphStore::new(),
            begins: AtomicUsize::new(0),
            failing: calls.to_vec(),
        }
    }
}

impl GraphStore for FlakyStore {
    fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>, StoreError> {
        let call = self.begins.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&call) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.begin()
    }

    fn concepts(&self) -> Result<Vec<Concept>, StoreError> {
        self.inner.concepts()
    }

    fn chunks(&self) -> Result<Vec<Chunk>, StoreError> {
        self.inner.chunks()
    }

    fn chunks_mentioning(&self, key: &ConceptKey) -> Result<Vec<Chunk>, StoreError> {
        self.inner.chunks_mentioning(key)
    }

    fn relationships(&self) -> Result<Vec<Relationship>, StoreError> {
        self.inner.relationships()
    }

    fn mention_count(&self, key: &ConceptKey) -> Result<usize, StoreError> {
        self.inner.mention_count(key)
    }

    fn stats(&self) -> Result<GraphStats, StoreError> {
        self.inner.stats()
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        retry_backoff: Duration::from_millis(1),
        llm_timeout: Duration::from_secs(5),
        ..PipelineSettings::default()
    }
}

fn setup() -> (Arc<FixtureModel>, Arc<MemoryGraphStore>, KnowledgePipeline) {
    let model = Arc::new(FixtureModel::default());
    let store = Arc::new(MemoryGraphStore::new());
    let pipeline = KnowledgePipeline::new(model.clone(), store.clone(), settings()).unwrap();
    (model, store, pipeline)
}

#[tokio::test]
async fn test_ingest_builds_graph() {
    let (_, store, pipeline) = setup();

    let report = pipeline.ingest("geo", PARIS_TEXT).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.chunks_total, 1);
    assert_eq!(report.concepts_created, 3);
    assert_eq!(report.mentions_created, 3);

    let keys: Vec<String> = store
        .concepts()
        .unwrap()
        .into_iter()
        .map(|c| c.key.to_string())
        .collect();
    assert_eq!(keys, vec!["eiffel tower", "france", "paris"]);

    let capital = RelationshipKey {
        source: ConceptKey::new("Paris"),
        target: ConceptKey::new("France"),
        relation_type: RelationType::CapitalOf,
    };
    assert!(store
        .relationships()
        .unwrap()
        .iter()
        .any(|r| r.key() == capital));

    let chunk_id = ChunkId::derive("geo", 0);
    for key in ["paris", "france", "eiffel tower"] {
        let mentioning = store.chunks_mentioning(&ConceptKey::new(key)).unwrap();
        assert_eq!(mentioning.iter().map(|c| c.id).collect::<Vec<_>>(), vec![chunk_id]);
    }
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let (_, store, pipeline) = setup();

    pipeline.ingest("geo", PARIS_TEXT).await.unwrap();
    let stats = store.stats().unwrap();
    let concepts = store.concepts().unwrap();
    let relationships = store.relationships().unwrap();

    let second = pipeline.ingest("geo", PARIS_TEXT).await.unwrap();

    assert_eq!(second.concepts_created, 0);
    assert_eq!(second.relationships_created, 0);
    assert_eq!(second.mentions_created, 0);
    assert_eq!(store.stats().unwrap(), stats);
    assert_eq!(store.concepts().unwrap(), concepts);
    assert_eq!(store.relationships().unwrap(), relationships);
}

#[tokio::test]
async fn test_question_is_answered_from_the_capital_chunk() {
    let (_, store, pipeline) = setup();
    pipeline.ingest("geo", PARIS_TEXT).await.unwrap();
    pipeline
        .ingest("notes", "Rust is a systems programming language.")
        .await
        .unwrap();

    let question = "What is the capital of France?";
    let ranked = Retriever::new(store.clone()).retrieve(question, 5).unwrap();
    assert!(ranked[0].chunk.text.contains("capital of France"));

    let answer = pipeline.ask(question).await.unwrap();

    assert_eq!(answer.citations, vec![ChunkId::derive("geo", 0)]);
    assert_eq!(answer.dropped_citations, vec!["chunk-999".to_string()]);
    assert!(answer.concepts.contains(&"France".to_string()));
    assert!(answer.citations.iter().all(|id| answer.context.contains(id)));
    assert!(answer.confidence > 0.0 && answer.confidence <= 1.0);
}

#[tokio::test]
async fn test_empty_document_writes_nothing() {
    let (model, store, pipeline) = setup();

    let error = pipeline.ingest("blank", "  \n\n ").await.unwrap_err();

    assert!(matches!(error, PipelineError::EmptyDocument { .. }));
    assert_eq!(store.stats().unwrap(), GraphStats::default());
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_question_against_empty_store_is_insufficient() {
    let (model, _, pipeline) = setup();

    let error = pipeline.ask("What is the capital of France?").await.unwrap_err();

    assert!(matches!(error, PipelineError::NoContext));
    assert!(error.is_insufficient_information());
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_invalid_extraction_skips_only_that_chunk() {
    let model = Arc::new(FixtureModel::default());
    let store = Arc::new(MemoryGraphStore::new());
    let pipeline = KnowledgePipeline::new(
        model.clone(),
        store.clone(),
        PipelineSettings {
            max_tokens: 12,
            overlap: 0,
            ..settings()
        },
    )
    .unwrap();
    let text = format!(
        "Rust is a systems programming language focused on safety.\n\n\
         This paragraph is broken.\n\n{}",
        PARIS_TEXT
    );

    let report = pipeline.ingest("mixed", &text).await.unwrap();

    assert_eq!(report.chunks_total, 3);
    assert_eq!(report.chunks_merged, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].sequence_index, 1);
    assert!(report.skipped[0].reason.contains("after 2 attempts"));
    assert_eq!(store.stats().unwrap().chunks, 2);
    assert_eq!(store.stats().unwrap().concepts, 3);
    // two calls per chunk for the broken one, one for each of the others
    assert_eq!(model.calls(), 4);
}

#[tokio::test]
async fn test_store_failures_are_retried() {
    let store = Arc::new(FlakyStore::failing_first(2));
    let pipeline =
        KnowledgePipeline::new(Arc::new(FixtureModel::default()), store.clone(), settings())
            .unwrap();

    let report = pipeline.ingest("geo", PARIS_TEXT).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(store.stats().unwrap().concepts, 3);
}

#[tokio::test]
async fn test_persistent_store_failure_skips_the_chunk() {
    let store = Arc::new(FlakyStore::failing_first(10));
    let pipeline = KnowledgePipeline::new(
        Arc::new(FixtureModel::default()),
        store.clone(),
        PipelineSettings {
            merge_retries: 2,
            ..settings()
        },
    )
    .unwrap();

    let report = pipeline.ingest("geo", PARIS_TEXT).await.unwrap();

    assert_eq!(report.chunks_total, 1);
    assert_eq!(report.chunks_merged, 0);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].chunk_id, ChunkId::derive("geo", 0));
    assert!(report.skipped[0].reason.contains("Merge failed"));
    assert_eq!(store.stats().unwrap(), GraphStats::default());
}

#[tokio::test]
async fn test_failed_merge_does_not_stop_later_chunks() {
    // one initial attempt and one retry for the second chunk both fail
    let store = Arc::new(FlakyStore::failing_calls(&[1, 2]));
    let pipeline = KnowledgePipeline::new(
        Arc::new(FixtureModel::default()),
        store.clone(),
        PipelineSettings {
            max_tokens: 12,
            overlap: 0,
            merge_retries: 1,
            ..settings()
        },
    )
    .unwrap();
    let text = format!(
        "Rust is a systems programming language focused on safety.\n\n\
         Rome is the capital of Italy today.\n\n{}",
        PARIS_TEXT
    );

    let report = pipeline.ingest("trip", &text).await.unwrap();

    assert_eq!(report.chunks_total, 3);
    assert_eq!(report.chunks_merged, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].sequence_index, 1);
    assert!(report.skipped[0].reason.contains("Merge failed"));
    let stats = store.stats().unwrap();
    assert_eq!(stats.chunks, 2);
    assert_eq!(stats.concepts, 3);
}

#[tokio::test]
async fn test_changed_document_does_not_rewire_stored_chunks() {
    let (_, store, pipeline) = setup();
    pipeline.ingest("doc", "Paris is lovely.").await.unwrap();
    let before = store.stats().unwrap();

    let report = pipeline.ingest("doc", "Berlin is big.").await.unwrap();

    assert_eq!(report.chunks_merged, 0);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].reason.contains("no longer matches"));
    assert_eq!(store.stats().unwrap(), before);
    assert!(store
        .chunks_mentioning(&ConceptKey::new("Berlin"))
        .unwrap()
        .is_empty());
    let chunks = store.chunks().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text, "Paris is lovely.");
}

#[tokio::test]
async fn test_concurrent_ingests_share_concepts() {
    let (_, store, pipeline) = setup();

    let (geo, travel) = tokio::join!(
        pipeline.ingest("geo", PARIS_TEXT),
        pipeline.ingest("travel", "The Eiffel Tower is in Paris, the capital of France.")
    );
    let (geo, travel) = (geo.unwrap(), travel.unwrap());

    assert!(geo.is_complete() && travel.is_complete());
    assert_eq!(geo.concepts_created + travel.concepts_created, 3);
    assert_eq!(geo.relationships_created + travel.relationships_created, 2);
    assert_eq!(geo.relationships_merged + travel.relationships_merged, 2);
    assert_eq!(
        store.stats().unwrap(),
        GraphStats {
            chunks: 2,
            concepts: 3,
            relationships: 2,
            mentions: 6
        }
    );

    let keys: Vec<String> = store
        .concepts()
        .unwrap()
        .into_iter()
        .map(|c| c.key.to_string())
        .collect();
    assert_eq!(keys, vec!["eiffel tower", "france", "paris"]);
    let relationship_keys: Vec<RelationshipKey> =
        store.relationships().unwrap().iter().map(|r| r.key()).collect();
    let unique: std::collections::BTreeSet<_> = relationship_keys.iter().collect();
    assert_eq!(unique.len(), relationship_keys.len());
}

#[tokio::test]
async fn test_cancel_interrupts_a_stalled_extraction() {
    let store = Arc::new(MemoryGraphStore::new());
    let pipeline = KnowledgePipeline::new(
        Arc::new(StalledModel),
        store.clone(),
        PipelineSettings {
            llm_timeout: Duration::from_secs(60),
            ..settings()
        },
    )
    .unwrap();
    let token = pipeline.cancellation_token();

    let cancel_soon = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    };
    let (report, _) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(pipeline.ingest("geo", PARIS_TEXT), cancel_soon)
    })
    .await
    .expect("cancellation waited for the model timeout");

    let report = report.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.chunks_merged, 0);
    assert_eq!(store.stats().unwrap(), GraphStats::default());
}

#[tokio::test]
async fn test_graph_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("graph.json");

    {
        let store = Arc::new(MemoryGraphStore::open(&path).unwrap());
        let pipeline =
            KnowledgePipeline::new(Arc::new(FixtureModel::default()), store.clone(), settings())
                .unwrap();
        pipeline.ingest("geo", PARIS_TEXT).await.unwrap();
        store.persist().unwrap();
    }

    let store = Arc::new(MemoryGraphStore::open(&path).unwrap());
    let pipeline =
        KnowledgePipeline::new(Arc::new(FixtureModel::default()), store.clone(), settings())
            .unwrap();

    assert_eq!(store.stats().unwrap().concepts, 3);
    let answer = pipeline.ask("What is the capital of France?").await.unwrap();
    assert_eq!(answer.citations, vec![ChunkId::derive("geo", 0)]);

    let suggestions = pipeline.suggest_questions().unwrap();
    assert!(suggestions.len() <= 8);
    assert!(suggestions.iter().any(|q| q == "What is Paris?"));

    let export = pipeline.export().unwrap();
    assert_eq!(export.nodes.len(), 3);
    assert_eq!(export.edges.len(), 2);
}
