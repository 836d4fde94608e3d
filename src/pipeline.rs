//! The caller-facing `ingest`/`ask` surface.
//!
//! Extraction for one document fans out over at most
//! `max_concurrent_requests` model calls, but merges are applied one chunk
//! at a time in sequence order so reports are reproducible. Cancellation
//! interrupts pending extractions and takes effect between merges.

use futures::{pin_mut, stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::answerer::{Answer, Answerer};
use crate::chunker::Chunker;
use crate::config::Config;
use crate::error::PipelineError;
use crate::extractor::{ExtractionResult, Extractor};
use crate::external::{LanguageModel, OllamaClient};
use crate::graph::{export_graph, Chunk, GraphExport, GraphStats, GraphStore};
use crate::merger::{GraphMerger, MergeReport};
use crate::retriever::{self, Retriever};

const MAX_SUGGESTIONS: usize = 8;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_tokens: usize,
    pub overlap: usize,
    pub top_k: usize,
    pub max_concurrent_requests: usize,
    pub merge_retries: usize,
    /// Delay before the first merge retry; doubled on each further attempt
    pub retry_backoff: Duration,
    pub llm_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tokens: config.chunking.max_tokens,
            overlap: config.chunking.overlap,
            top_k: config.retrieval.top_k,
            max_concurrent_requests: config.processing.max_concurrent_requests,
            merge_retries: config.processing.merge_retries,
            retry_backoff: Duration::from_millis(200),
            llm_timeout: config.llm.timeout(),
        }
    }
}

pub struct KnowledgePipeline {
    chunker: Chunker,
    extractor: Extractor,
    merger: GraphMerger,
    retriever: Retriever,
    answerer: Answerer,
    store: Arc<dyn GraphStore>,
    settings: PipelineSettings,
    cancellation_token: CancellationToken,
}

impl KnowledgePipeline {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn GraphStore>,
        settings: PipelineSettings,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            chunker: Chunker::new(settings.max_tokens, settings.overlap)?,
            extractor: Extractor::new(model.clone(), settings.llm_timeout),
            merger: GraphMerger::new(store.clone()),
            retriever: Retriever::new(store.clone()),
            answerer: Answerer::new(model, settings.llm_timeout),
            store,
            settings,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Build a pipeline talking to the Ollama service named in the config
    pub fn from_config(config: &Config, store: Arc<dyn GraphStore>) -> Result<Self, PipelineError> {
        let model = Arc::new(OllamaClient::new(config.llm.clone())?);
        Self::new(model, store, PipelineSettings::from_config(config))
    }

    /// Token that stops ingestion from another task.
    ///
    /// Once cancelled it stays cancelled; later `ingest` calls on this
    /// pipeline return at once with `cancelled` set.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Chunk, extract and merge one document into the graph.
    ///
    /// Chunks whose extraction fails, whose merge still fails after
    /// `merge_retries` backoff rounds, or whose stored text conflicts are
    /// skipped and listed in the report. Only an empty document or bad
    /// chunking parameters fail the whole call.
    pub async fn ingest(&self, document_id: &str, text: &str) -> Result<MergeReport, PipelineError> {
        let chunks = self.chunker.chunk(document_id, text)?;
        info!(document_id, chunks = chunks.len(), "Ingesting document");

        let extractor = &self.extractor;
        let extractions = stream::iter(chunks.iter())
            .map(|chunk| async move { (chunk, extractor.extract(chunk).await) })
            .buffered(self.settings.max_concurrent_requests.max(1));
        pin_mut!(extractions);

        let mut report = MergeReport::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    warn!(document_id, merged = report.chunks_merged, "Ingestion cancelled");
                    report.cancelled = true;
                    break;
                }
                next = extractions.next() => next,
            };
            let Some((chunk, outcome)) = next else {
                break;
            };

            let merged = match outcome {
                Ok(result) => self.merge_with_retry(document_id, chunk, &result).await,
                Err(e) => Err(e),
            };
            match merged {
                Ok(merged) => report.absorb(merged),
                Err(e) => {
                    warn!(document_id, chunk_id = %chunk.id, error = %e, "Skipping chunk");
                    report.record_skip(chunk, e.to_string());
                }
            }
        }
        report.chunks_total = chunks.len();

        info!(
            document_id,
            chunks_total = report.chunks_total,
            chunks_merged = report.chunks_merged,
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "Finished ingesting document"
        );
        Ok(report)
    }

    async fn merge_with_retry(
        &self,
        document_id: &str,
        chunk: &Chunk,
        result: &ExtractionResult,
    ) -> Result<MergeReport, PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            match self.merger.merge(document_id, chunk, result) {
                Ok(report) => return Ok(report),
                Err(e @ PipelineError::MergeFailed { .. })
                    if (attempt as usize) < self.settings.merge_retries =>
                {
                    let delay = self
                        .settings
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        chunk_id = %chunk.id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Merge failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Answer a question from the graph, or fail with `NoContext`
    pub async fn ask(&self, question: &str) -> Result<Answer, PipelineError> {
        let retrieval = self.retriever.search(question, self.settings.top_k)?;
        if retrieval.chunks.is_empty() {
            info!(question, "No relevant context found");
            return Err(PipelineError::NoContext);
        }

        let confidence = retrieval.confidence(question);
        let concepts: Vec<String> = retrieval
            .concepts
            .iter()
            .map(|c| c.canonical_name.clone())
            .collect();
        let context: Vec<Chunk> = retrieval.chunks.into_iter().map(|s| s.chunk).collect();

        let answer = self
            .answerer
            .answer_with_concepts(question, &context, &concepts)
            .await?;
        Ok(answer.with_confidence(confidence))
    }

    pub fn suggest_questions(&self) -> Result<Vec<String>, PipelineError> {
        Ok(retriever::suggest_questions(
            self.store.as_ref(),
            MAX_SUGGESTIONS,
        )?)
    }

    pub fn export(&self) -> Result<GraphExport, PipelineError> {
        Ok(export_graph(self.store.as_ref())?)
    }

    pub fn stats(&self) -> Result<GraphStats, PipelineError> {
        Ok(self.store.stats()?)
    }
}
