//! Grounded answer synthesis over retrieved chunks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::contract::{call_with_retry, parse_json};
use crate::error::PipelineError;
use crate::external::{LanguageModel, ModelRequest};
use crate::graph::{Chunk, ChunkId};

const SYSTEM_PROMPT: &str = "You answer questions using only the supplied context. \
     Every statement must be supported by the chunks you cite. \
     If the context does not contain the answer, say so plainly.";

/// A grounded answer; every citation refers to a chunk of its context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<ChunkId>,
    /// Citations the model produced that were not part of the context
    pub dropped_citations: Vec<String>,
    /// Names of the graph concepts the question matched
    pub concepts: Vec<String>,
    /// Ids of the chunks the answer was composed from
    pub context: Vec<ChunkId>,
    /// How well the retrieved context covers the question, in [0, 1].
    /// Zero when the context was supplied by the caller rather than retrieved.
    pub confidence: f32,
}

impl Answer {
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    answer: String,
    #[serde(default)]
    citations: Vec<String>,
}

fn parse_answer(reply: &str) -> Result<RawAnswer, String> {
    let raw: RawAnswer = parse_json(reply)?;
    if raw.answer.trim().is_empty() {
        return Err("answer is empty".to_string());
    }
    Ok(raw)
}

/// Accept ids written as `<uuid>`, `chunk <uuid>` or `[chunk <uuid>]`
fn parse_citation(citation: &str) -> Option<ChunkId> {
    let inner = citation.trim().trim_start_matches('[').trim_end_matches(']').trim();
    let inner = inner.strip_prefix("chunk").unwrap_or(inner);
    inner.parse().ok()
}

/// Split model citations into those found in the context and the rest.
///
/// Kept citations preserve the model's order without repeats.
pub fn validate_citations(cited: &[String], context: &[Chunk]) -> (Vec<ChunkId>, Vec<String>) {
    let allowed: HashSet<ChunkId> = context.iter().map(|c| c.id).collect();
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut dropped = Vec::new();

    for citation in cited {
        match parse_citation(citation) {
            Some(id) if allowed.contains(&id) => {
                if seen.insert(id) {
                    kept.push(id);
                }
            }
            _ => dropped.push(citation.clone()),
        }
    }

    (kept, dropped)
}

#[derive(Clone)]
pub struct Answerer {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl Answerer {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["answer", "citations"],
            "properties": {
                "answer": { "type": "string" },
                "citations": { "type": "array", "items": { "type": "string" } }
            }
        })
    }

    fn request(question: &str, context: &[Chunk], concepts: &[String]) -> ModelRequest {
        let sources = context
            .iter()
            .map(|chunk| format!("[chunk {}]\n{}", chunk.id, chunk.text.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut prompt = format!("Context:\n{}\n\n", sources);
        if !concepts.is_empty() {
            prompt.push_str(&format!("Relevant concepts: {}\n\n", concepts.join(", ")));
        }
        prompt.push_str(&format!(
            "Question: {}\n\n\
             Answer in a few sentences. List in \"citations\" the ids of the chunks \
             you used, exactly as they appear after \"chunk\".",
            question.trim()
        ));

        ModelRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt,
            schema: Self::schema(),
        }
    }

    /// Answer a question from the given context only
    pub async fn answer(&self, question: &str, context: &[Chunk]) -> Result<Answer, PipelineError> {
        self.answer_with_concepts(question, context, &[]).await
    }

    /// Like [`Answerer::answer`], naming the graph concepts the question matched
    pub async fn answer_with_concepts(
        &self,
        question: &str,
        context: &[Chunk],
        concepts: &[String],
    ) -> Result<Answer, PipelineError> {
        if context.is_empty() {
            return Err(PipelineError::NoContext);
        }

        let request = Self::request(question, context, concepts);
        let raw = call_with_retry(self.model.as_ref(), &request, self.timeout, parse_answer)
            .await
            .map_err(|failure| PipelineError::AnswerUnavailable {
                attempts: failure.attempts,
                reason: failure.reason,
            })?;

        let (citations, dropped_citations) = validate_citations(&raw.citations, context);
        if !dropped_citations.is_empty() {
            warn!(dropped = ?dropped_citations, "Dropped citations outside the context");
        }
        info!(
            context = context.len(),
            citations = citations.len(),
            "Answered question"
        );

        Ok(Answer {
            text: raw.answer.trim().to_string(),
            citations,
            dropped_citations,
            concepts: concepts.to_vec(),
            context: context.iter().map(|c| c.id).collect(),
            confidence: 0.0,
        })
    }
}
