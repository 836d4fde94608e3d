//! Relevance-ranked context selection.
//!
//! A chunk scores one point per question concept it mentions, up to
//! [`RELATED_WEIGHT`] for mentioning a concept one relationship away from
//! those, and up to [`LEXICAL_WEIGHT`] for keyword overlap with the
//! question. The two partial components together stay below one point, so
//! any concept-grounded chunk outranks every chunk that is not. Equal scores
//! fall back to document order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::error::PipelineError;
use crate::graph::{Chunk, ChunkId, Concept, ConceptKey, GraphStore, Relationship, StoreError};

/// Ceiling of the lexical component
pub const LEXICAL_WEIGHT: f32 = 0.5;

/// Ceiling of the related-concept component, scaled by relationship confidence
pub const RELATED_WEIGHT: f32 = 0.25;

/// Matched concepts whose neighbours are followed
const EXPANDED_CONCEPTS: usize = 5;
const NEIGHBOURS_PER_CONCEPT: usize = 3;

const STOP_WORDS: &[&str] = &[
    "what", "how", "why", "when", "where", "who", "which", "is", "are", "was", "were", "do",
    "does", "did", "can", "could", "the", "a", "an", "and", "or", "but", "in", "on", "at", "to",
    "for", "of", "with", "by", "about", "tell", "me", "explain", "it", "its", "this", "that",
];

/// Lowercased alphanumeric words of a text
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Crude plural folding so "bridges" meets "bridge"
fn stem(word: &str) -> &str {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        &word[..word.len() - 1]
    } else {
        word
    }
}

fn keywords(tokens: &[String]) -> BTreeSet<&str> {
    tokens
        .iter()
        .map(String::as_str)
        .filter(|w| w.len() > 2 && !is_stop_word(w))
        .map(stem)
        .collect()
}

/// Whether `phrase` occurs as a contiguous run of `tokens`
fn contains_phrase(tokens: &[String], phrase: &[String]) -> bool {
    if phrase.is_empty() || phrase.iter().all(|w| is_stop_word(w)) || phrase.len() > tokens.len() {
        return false;
    }
    tokens.windows(phrase.len()).any(|window| {
        window
            .iter()
            .zip(phrase)
            .all(|(a, b)| stem(a) == stem(b))
    })
}

/// Share of question keywords present in the text, in [0, 1]
fn lexical_overlap(question_keywords: &BTreeSet<&str>, text: &str) -> f32 {
    if question_keywords.is_empty() {
        return 0.0;
    }
    let tokens = tokenize(text);
    let present: BTreeSet<&str> = tokens.iter().map(|t| stem(t)).collect();
    let shared = question_keywords.iter().filter(|k| present.contains(*k)).count();
    shared as f32 / question_keywords.len() as f32
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
    /// Number of question concepts this chunk mentions
    pub matched_concepts: usize,
    /// Strongest relationship confidence linking a mentioned concept to a
    /// question concept; zero when the chunk mentions no neighbour
    pub relation_strength: f32,
}

/// Ranked context for a question together with the concepts it matched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Retrieval {
    pub chunks: Vec<ScoredChunk>,
    pub concepts: Vec<Concept>,
    /// Neighbours of the matched concepts that widened the context
    pub related: Vec<Concept>,
}

impl Retrieval {
    /// Heuristic confidence in [0, 1] that the context can answer `question`.
    ///
    /// Weighs how many concepts were found, how substantial the chunks are,
    /// the share of chunks grounded in a question concept and how many
    /// question keywords the found concepts cover.
    pub fn confidence(&self, question: &str) -> f32 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        let returned = self.chunks.len() as f32;

        let found = (self.concepts.len() + self.related.len()) as f32;
        let breadth = (found / 10.0).min(1.0);

        let substance = self
            .chunks
            .iter()
            .map(|s| (s.chunk.text.chars().count() as f32 / 1000.0).min(1.0))
            .sum::<f32>()
            / returned;

        let grounded = self
            .chunks
            .iter()
            .filter(|s| s.matched_concepts > 0)
            .count() as f32
            / returned;

        let question_tokens = tokenize(question);
        let question_keywords = keywords(&question_tokens);
        let coverage = if question_keywords.is_empty() {
            0.0
        } else {
            let names: BTreeSet<String> = self
                .concepts
                .iter()
                .chain(&self.related)
                .flat_map(|c| std::iter::once(&c.canonical_name).chain(c.aliases.iter()))
                .flat_map(|name| tokenize(name))
                .map(|token| stem(&token).to_string())
                .collect();
            question_keywords
                .iter()
                .filter(|k| names.contains(**k))
                .count() as f32
                / question_keywords.len() as f32
        };

        (0.3 * breadth + 0.3 * substance + 0.2 * grounded + 0.2 * coverage).min(1.0)
    }
}

#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn GraphStore>,
}

impl Retriever {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Top `k` chunks for the question, best first
    pub fn retrieve(&self, question: &str, k: usize) -> Result<Vec<ScoredChunk>, PipelineError> {
        Ok(self.search(question, k)?.chunks)
    }

    /// Like [`Retriever::retrieve`], also returning the matched concepts
    pub fn search(&self, question: &str, k: usize) -> Result<Retrieval, PipelineError> {
        let chunks = self.store.chunks()?;
        if chunks.is_empty() || k == 0 {
            return Ok(Retrieval::default());
        }

        let question_tokens = tokenize(question);
        let all_concepts = self.store.concepts()?;
        let concepts = matching_concepts(&all_concepts, &question_tokens);
        let related = related_concepts(&all_concepts, &concepts, &self.store.relationships()?);

        let mut hits: HashMap<ChunkId, usize> = HashMap::new();
        for concept in &concepts {
            for chunk in self.store.chunks_mentioning(&concept.key)? {
                *hits.entry(chunk.id).or_default() += 1;
            }
        }

        let mut strengths: HashMap<ChunkId, f32> = HashMap::new();
        for (concept, strength) in &related {
            for chunk in self.store.chunks_mentioning(&concept.key)? {
                let entry = strengths.entry(chunk.id).or_default();
                *entry = entry.max(*strength);
            }
        }

        let question_keywords = keywords(&question_tokens);
        let mut scored: Vec<ScoredChunk> = chunks
            .into_iter()
            .filter_map(|chunk| {
                let matched_concepts = hits.get(&chunk.id).copied().unwrap_or(0);
                let relation_strength = strengths.get(&chunk.id).copied().unwrap_or(0.0);
                let lexical = lexical_overlap(&question_keywords, &chunk.text);
                let score = matched_concepts as f32
                    + RELATED_WEIGHT * relation_strength
                    + LEXICAL_WEIGHT * lexical;
                (score > 0.0).then_some(ScoredChunk {
                    chunk,
                    score,
                    matched_concepts,
                    relation_strength,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.position().cmp(&b.chunk.position()))
        });
        scored.truncate(k);

        debug!(
            matched_concepts = concepts.len(),
            related_concepts = related.len(),
            returned = scored.len(),
            "Retrieved context"
        );
        Ok(Retrieval {
            chunks: scored,
            concepts,
            related: related.into_iter().map(|(concept, _)| concept).collect(),
        })
    }
}

/// Concepts whose name or an alias appears in the question
fn matching_concepts(concepts: &[Concept], question_tokens: &[String]) -> Vec<Concept> {
    concepts
        .iter()
        .filter(|concept| {
            std::iter::once(&concept.canonical_name)
                .chain(concept.aliases.iter())
                .any(|name| contains_phrase(question_tokens, &tokenize(name)))
        })
        .cloned()
        .collect()
}

/// Strongest neighbours of the matched concepts, in either edge direction,
/// paired with the highest confidence linking them. Matched concepts are
/// never their own neighbours.
fn related_concepts(
    concepts: &[Concept],
    matched: &[Concept],
    relationships: &[Relationship],
) -> Vec<(Concept, f32)> {
    let matched_keys: HashSet<&ConceptKey> = matched.iter().map(|c| &c.key).collect();
    let mut strongest: BTreeMap<&ConceptKey, f32> = BTreeMap::new();

    for concept in matched.iter().take(EXPANDED_CONCEPTS) {
        let mut neighbours: Vec<(&ConceptKey, f32)> = relationships
            .iter()
            .filter_map(|r| {
                if r.source == concept.key {
                    Some((&r.target, r.confidence))
                } else if r.target == concept.key {
                    Some((&r.source, r.confidence))
                } else {
                    None
                }
            })
            .filter(|(key, _)| !matched_keys.contains(key))
            .collect();
        neighbours.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        for (key, confidence) in neighbours.into_iter().take(NEIGHBOURS_PER_CONCEPT) {
            let entry = strongest.entry(key).or_insert(confidence);
            *entry = entry.max(confidence);
        }
    }

    concepts
        .iter()
        .filter_map(|c| strongest.get(&c.key).map(|strength| (c.clone(), *strength)))
        .collect()
}

/// Starter questions built from the most-mentioned concepts
pub fn suggest_questions(store: &dyn GraphStore, limit: usize) -> Result<Vec<String>, StoreError> {
    let mut ranked = Vec::new();
    for concept in store.concepts()? {
        let mentions = store.mention_count(&concept.key)?;
        ranked.push((mentions, concept));
    }
    ranked.sort_by(|(ma, a), (mb, b)| mb.cmp(ma).then_with(|| a.key.cmp(&b.key)));

    let mut suggestions = Vec::new();
    for (_, concept) in ranked.iter().take(3) {
        let name = &concept.canonical_name;
        suggestions.push(format!("What is {}?", name));
        suggestions.push(format!("How does {} relate to other concepts?", name));
        suggestions.push(format!("Tell me more about {}", name));
    }
    suggestions.extend([
        "What are the main topics in these documents?".to_string(),
        "What relationships exist between concepts?".to_string(),
        "Summarize the key information".to_string(),
    ]);

    suggestions.truncate(limit);
    Ok(suggestions)
}
