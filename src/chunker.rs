//! Splitting documents into overlapping, bounded retrieval units.
//!
//! Token counts are approximated by whitespace-delimited words. Documents
//! are split on paragraph boundaries first, then on sentence boundaries, and
//! only a sentence that alone exceeds the budget is cut mid-sentence.

use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::PipelineError;
use crate::graph::{CharSpan, Chunk};

fn paragraph_break() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\n[ \t]*\n\s*").unwrap())
}

fn sentence_end() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"[.!?]+["')\]]*\s+"#).unwrap())
}

fn word() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\S+\s*").unwrap())
}

pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Split `text[range]` into contiguous pieces, each ending just after a
/// match of `pattern`
fn split_after(text: &str, range: Range<usize>, pattern: &Regex) -> Vec<Range<usize>> {
    let slice = &text[range.clone()];
    let mut pieces = Vec::new();
    let mut last = 0;

    for m in pattern.find_iter(slice) {
        if m.end() > last {
            pieces.push(range.start + last..range.start + m.end());
            last = m.end();
        }
    }
    if last < slice.len() {
        pieces.push(range.start + last..range.end);
    }

    pieces
}

/// A contiguous stretch of text that is never split further
struct Unit {
    span: Range<usize>,
    tokens: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_tokens: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(max_tokens: usize, overlap: usize) -> Result<Self, PipelineError> {
        if max_tokens == 0 {
            return Err(PipelineError::InvalidChunking(
                "max_tokens must be positive".to_string(),
            ));
        }
        if overlap >= max_tokens {
            return Err(PipelineError::InvalidChunking(format!(
                "overlap ({}) must be smaller than max_tokens ({})",
                overlap, max_tokens
            )));
        }
        Ok(Self {
            max_tokens,
            overlap,
        })
    }

    /// Split a document into chunks whose spans jointly cover all of `text`.
    ///
    /// Consecutive chunks either touch or overlap by whole units whose
    /// token total stays within the configured overlap.
    pub fn chunk(&self, document_id: &str, text: &str) -> Result<Vec<Chunk>, PipelineError> {
        if text.trim().is_empty() {
            return Err(PipelineError::EmptyDocument {
                document_id: document_id.to_string(),
            });
        }

        let units = self.units(text);
        let mut chunks = Vec::new();
        let mut start = 0;

        loop {
            let mut end = start;
            let mut used = 0;
            while end < units.len() && (end == start || used + units[end].tokens <= self.max_tokens) {
                used += units[end].tokens;
                end += 1;
            }

            let span = units[start].span.start..units[end - 1].span.end;
            chunks.push(Chunk::new(
                document_id,
                chunks.len(),
                text[span.clone()].to_string(),
                CharSpan::new(span.start, span.end),
            ));

            if end == units.len() {
                break;
            }

            // Carry trailing units forward, keeping room for the next new unit
            let upcoming = units[end].tokens;
            let mut next = end;
            let mut carried = 0;
            while next > start + 1 {
                let candidate = carried + units[next - 1].tokens;
                if candidate > self.overlap || candidate + upcoming > self.max_tokens {
                    break;
                }
                carried = candidate;
                next -= 1;
            }
            start = next;
        }

        debug!(
            document_id,
            chunks = chunks.len(),
            units = units.len(),
            "Chunked document"
        );
        Ok(chunks)
    }

    /// Partition the whole text into units of at most `max_tokens` tokens
    fn units(&self, text: &str) -> Vec<Unit> {
        let mut spans = Vec::new();
        for paragraph in split_after(text, 0..text.len(), paragraph_break()) {
            if count_tokens(&text[paragraph.clone()]) <= self.max_tokens {
                spans.push(paragraph);
                continue;
            }
            for sentence in split_after(text, paragraph, sentence_end()) {
                if count_tokens(&text[sentence.clone()]) <= self.max_tokens {
                    spans.push(sentence);
                } else {
                    spans.extend(self.hard_cut(text, sentence));
                }
            }
        }

        // Whitespace-only pieces join their neighbour so coverage stays gapless
        let mut units: Vec<Unit> = Vec::new();
        let mut leading: Option<usize> = None;
        for span in spans {
            let tokens = count_tokens(&text[span.clone()]);
            if tokens == 0 {
                match units.last_mut() {
                    Some(last) => last.span.end = span.end,
                    None => {
                        leading.get_or_insert(span.start);
                    }
                }
                continue;
            }
            let start = leading.take().unwrap_or(span.start);
            units.push(Unit {
                span: start..span.end,
                tokens,
            });
        }

        units
    }

    /// Cut an oversized sentence into windows of `max_tokens` words
    fn hard_cut(&self, text: &str, range: Range<usize>) -> Vec<Range<usize>> {
        let mut pieces = Vec::new();
        let mut start = range.start;
        let mut words = 0;

        for m in word().find_iter(&text[range.clone()]) {
            words += 1;
            if words == self.max_tokens {
                let end = range.start + m.end();
                pieces.push(start..end);
                start = end;
                words = 0;
            }
        }
        if start < range.end {
            pieces.push(start..range.end);
        }

        pieces
    }
}

/// Chunk a document with one-off parameters
pub fn chunk(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, PipelineError> {
    Chunker::new(max_tokens, overlap)?.chunk(document_id, text)
}
