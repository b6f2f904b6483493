//! Sentence-aware chunking with page provenance, feeding the vector index.
//!
//! Chunks accumulate whole sentences up to a size budget, overlap by a
//! bounded tail of trailing sentences, and remember the page range they
//! were drawn from so answers can cite their source pages.

use crate::parsers::normalize_newlines;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub max_chunk_size: usize,
    pub min_chunk_size: usize,
    pub overlap_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1_000,
            min_chunk_size: 200,
            overlap_size: 100,
        }
    }
}

/// Page input to the chunker.
#[derive(Debug, Clone)]
pub struct PageText {
    pub page_number: i32,
    pub text: String,
}

/// One emitted chunk. Indices are contiguous from 0; `page_start` is
/// non-decreasing across consecutive chunks and never exceeds `page_end`.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: i32,
    pub content: String,
    pub page_start: i32,
    pub page_end: i32,
    pub sentences: Vec<String>,
}

pub struct SemanticChunker {
    config: ChunkerConfig,
}

impl SemanticChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn chunk(&self, pages: &[PageText]) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_len = 0usize;
        let mut page_start = 0i32;
        let mut page_end = 0i32;

        for page in pages {
            let text = collapse_newline_runs(&normalize_newlines(&page.text));
            for sentence in split_sentences(&text) {
                let sentence_len = sentence.chars().count();
                let projected = if current.is_empty() {
                    sentence_len
                } else {
                    current_len + 1 + sentence_len
                };

                if projected > self.config.max_chunk_size && !current.is_empty() {
                    if current_len >= self.config.min_chunk_size {
                        let emitted = std::mem::take(&mut current);
                        let seed = overlap_tail(&emitted, self.config.overlap_size);
                        chunks.push(Chunk {
                            index: chunks.len() as i32,
                            content: emitted.join(" "),
                            page_start,
                            page_end,
                            sentences: emitted,
                        });
                        current = seed;
                    } else {
                        // An undersized fragment squeezed out by an oversized
                        // sentence; it is covered by nothing, but keeping it
                        // would blow the budget.
                        current.clear();
                    }
                    current_len = joined_len(&current);
                    page_start = page.page_number;
                    page_end = page.page_number;
                }

                if current.is_empty() {
                    page_start = page.page_number;
                    current_len = sentence_len;
                } else {
                    current_len += 1 + sentence_len;
                }
                current.push(sentence);
                page_end = page.page_number;
            }
        }

        // The final chunk is dropped below the minimum size unless it is
        // the only content the document produced.
        if !current.is_empty() && (current_len >= self.config.min_chunk_size || chunks.is_empty()) {
            chunks.push(Chunk {
                index: chunks.len() as i32,
                content: current.join(" "),
                page_start,
                page_end,
                sentences: current,
            });
        }

        chunks
    }
}

fn joined_len(sentences: &[String]) -> usize {
    if sentences.is_empty() {
        return 0;
    }
    sentences.iter().map(|s| s.chars().count()).sum::<usize>() + sentences.len() - 1
}

/// Trailing sentences whose cumulative joined length stays within the
/// overlap budget, taken from the end, in original order.
fn overlap_tail(sentences: &[String], overlap_size: usize) -> Vec<String> {
    let mut tail: Vec<String> = Vec::new();
    let mut len = 0usize;
    for sentence in sentences.iter().rev() {
        let sentence_len = sentence.chars().count();
        let projected = if tail.is_empty() {
            sentence_len
        } else {
            len + 1 + sentence_len
        };
        if projected > overlap_size {
            break;
        }
        len = projected;
        tail.push(sentence.clone());
    }
    tail.reverse();
    tail
}

/// Collapses runs of three or more newlines down to two.
fn collapse_newline_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0usize;
    for c in text.chars() {
        if c == '\n' {
            run += 1;
            if run <= 2 {
                out.push(c);
            }
        } else {
            run = 0;
            out.push(c);
        }
    }
    out
}

/// Sentence boundary: `.`, `!` or `?` followed by whitespace and then an
/// uppercase letter (Unicode uppercase, so Ä, Ö and Ü qualify), or by a
/// whitespace run containing a newline.
fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    let mut push = |range: &[char], sentences: &mut Vec<String>| {
        let sentence: String = range.iter().collect();
        let trimmed = sentence.trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
    };

    while i < chars.len() {
        if matches!(chars[i], '.' | '!' | '?') {
            let mut j = i + 1;
            let mut saw_newline = false;
            while j < chars.len() && chars[j].is_whitespace() {
                saw_newline |= chars[j] == '\n';
                j += 1;
            }
            let is_boundary = if j >= chars.len() {
                true
            } else if j == i + 1 {
                false
            } else {
                saw_newline || chars[j].is_uppercase()
            };
            if is_boundary {
                push(&chars[start..=i], &mut sentences);
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }

    if start < chars.len() {
        push(&chars[start..], &mut sentences);
    }

    sentences
}
