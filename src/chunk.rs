//! Token-aware chunker.
//!
//! Input is a stream of extraction [`Segment`]s (text plus optional
//! page/paragraph hints); output is an ordered, gap-free sequence of
//! [`Chunk`]s. The chunker prefers to break at paragraph, then sentence,
//! then word boundaries, and never splits a token. When overlap is enabled
//! the tail `overlap` tokens of chunk *i* are re-emitted as the head of
//! chunk *i+1*.

use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::extract::Segment;
use crate::models::Chunk;

/// Counts tokens in a string. The embedding provider is the canonical
/// source of this unit ("tokenization is the same unit the embedding
/// provider uses"); the chunker is generic over it so tests and providers
/// without a real tokenizer can supply a cheap heuristic.
pub trait TokenCounter {
    fn count(&self, text: &str) -> usize;
}

/// Default heuristic counter: ~4 characters per token, the same rule of
/// thumb used for estimating OpenAI-family token counts without invoking a
/// real tokenizer.
pub struct CharHeuristicCounter;

const CHARS_PER_TOKEN: usize = 4;

impl TokenCounter for CharHeuristicCounter {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.chars().count() + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub overlap_enabled: bool,
}

/// A candidate unit considered for inclusion in a chunk: paragraph,
/// sentence, or word, carrying the hints of the segment it came from.
struct Unit<'a> {
    text: &'a str,
    page: Option<u32>,
    paragraph: Option<u32>,
}

/// Chunk a sequence of segments into dense, gap-free, ordered chunks.
///
/// `counter` should be the embedding provider's token counter so chunk
/// sizes reflect what will actually be embedded.
pub fn chunk_segments(
    document_id: &str,
    kb_id: &str,
    segments: &[Segment],
    params: ChunkParams,
    counter: &dyn TokenCounter,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_page: Option<u32> = None;
    let mut buf_paragraph: Option<u32> = None;
    let mut carry_overlap = String::new();

    let mut flush = |buf: &mut String,
                      page: Option<u32>,
                      paragraph: Option<u32>,
                      chunks: &mut Vec<Chunk>,
                      carry: &mut String| {
        let trimmed = buf.trim();
        if trimmed.is_empty() {
            buf.clear();
            return;
        }
        let idx = chunks.len();
        chunks.push(make_chunk(document_id, kb_id, idx, trimmed, page, paragraph));
        if params.overlap_enabled && params.overlap_tokens > 0 {
            *carry = tail_tokens(trimmed, params.overlap_tokens);
        } else {
            carry.clear();
        }
        buf.clear();
    };

    for segment in segments {
        for paragraph_text in segment.text.split("\n\n") {
            let paragraph_text = paragraph_text.trim();
            if paragraph_text.is_empty() {
                continue;
            }
            let unit = Unit {
                text: paragraph_text,
                page: segment.page,
                paragraph: segment.paragraph,
            };
            push_unit(
                &unit,
                params,
                counter,
                &mut buf,
                &mut buf_page,
                &mut buf_paragraph,
                &mut chunks,
                &mut carry_overlap,
                document_id,
                kb_id,
            );
        }
    }

    if !buf.trim().is_empty() {
        flush(
            &mut buf,
            buf_page,
            buf_paragraph,
            &mut chunks,
            &mut carry_overlap,
        );
    }

    chunks
}

#[allow(clippy::too_many_arguments)]
fn push_unit(
    unit: &Unit,
    params: ChunkParams,
    counter: &dyn TokenCounter,
    buf: &mut String,
    buf_page: &mut Option<u32>,
    buf_paragraph: &mut Option<u32>,
    chunks: &mut Vec<Chunk>,
    carry: &mut String,
    document_id: &str,
    kb_id: &str,
) {
    let unit_tokens = counter.count(unit.text);

    if unit_tokens > params.max_tokens {
        // Paragraph itself exceeds the budget: split at sentence boundaries.
        for sentence in unit.text.unicode_sentences() {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }
            let sentence_tokens = counter.count(sentence);
            if sentence_tokens > params.max_tokens {
                for word_group in split_into_word_groups(sentence, params.max_tokens, counter) {
                    append_or_flush(
                        &word_group,
                        unit.page,
                        unit.paragraph,
                        params,
                        counter,
                        buf,
                        buf_page,
                        buf_paragraph,
                        chunks,
                        carry,
                        document_id,
                        kb_id,
                    );
                }
            } else {
                append_or_flush(
                    sentence,
                    unit.page,
                    unit.paragraph,
                    params,
                    counter,
                    buf,
                    buf_page,
                    buf_paragraph,
                    chunks,
                    carry,
                    document_id,
                    kb_id,
                );
            }
        }
        return;
    }

    append_or_flush(
        unit.text,
        unit.page,
        unit.paragraph,
        params,
        counter,
        buf,
        buf_page,
        buf_paragraph,
        chunks,
        carry,
        document_id,
        kb_id,
    );
}

#[allow(clippy::too_many_arguments)]
fn append_or_flush(
    text: &str,
    page: Option<u32>,
    paragraph: Option<u32>,
    params: ChunkParams,
    counter: &dyn TokenCounter,
    buf: &mut String,
    buf_page: &mut Option<u32>,
    buf_paragraph: &mut Option<u32>,
    chunks: &mut Vec<Chunk>,
    carry: &mut String,
    document_id: &str,
    kb_id: &str,
) {
    let projected = if buf.is_empty() {
        text.to_string()
    } else {
        format!("{}\n\n{}", buf, text)
    };

    if counter.count(&projected) > params.max_tokens && !buf.is_empty() {
        let trimmed = buf.trim().to_string();
        let idx = chunks.len();
        chunks.push(make_chunk(
            document_id,
            kb_id,
            idx,
            &trimmed,
            *buf_page,
            *buf_paragraph,
        ));
        if params.overlap_enabled && params.overlap_tokens > 0 {
            *carry = tail_tokens(&trimmed, params.overlap_tokens);
        } else {
            carry.clear();
        }
        buf.clear();
        if !carry.is_empty() {
            buf.push_str(carry);
            buf.push_str("\n\n");
        }
        buf.push_str(text);
        *buf_page = page;
        *buf_paragraph = paragraph;
    } else {
        if buf.is_empty() {
            *buf_page = page;
            *buf_paragraph = paragraph;
        }
        *buf = projected;
    }
}

/// Split an over-long sentence into word groups that each fit `max_tokens`,
/// never splitting a word.
fn split_into_word_groups(sentence: &str, max_tokens: usize, counter: &dyn TokenCounter) -> Vec<String> {
    let words: Vec<&str> = sentence.unicode_words().collect();
    let mut groups = Vec::new();
    let mut current = String::new();

    for word in words {
        let projected = if current.is_empty() {
            word.to_string()
        } else {
            format!("{} {}", current, word)
        };
        if counter.count(&projected) > max_tokens && !current.is_empty() {
            groups.push(current.clone());
            current = word.to_string();
        } else {
            current = projected;
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    if groups.is_empty() && !sentence.trim().is_empty() {
        groups.push(sentence.trim().to_string());
    }
    groups
}

/// Return the last `n` tokens (approximated by words) of `text`, used to
/// seed the next chunk when overlap is enabled.
fn tail_tokens(text: &str, n: usize) -> String {
    let words: Vec<&str> = text.unicode_words().collect();
    if words.len() <= n {
        return text.to_string();
    }
    words[words.len() - n..].join(" ")
}

fn make_chunk(
    document_id: &str,
    kb_id: &str,
    sequence_index: usize,
    text: &str,
    page: Option<u32>,
    paragraph: Option<u32>,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(sequence_index.to_le_bytes());
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        kb_id: kb_id.to_string(),
        sequence_index,
        text: text.to_string(),
        token_count: CharHeuristicCounter.count(text),
        page,
        paragraph,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(text: &str) -> Segment {
        Segment {
            text: text.to_string(),
            page: None,
            paragraph: None,
        }
    }

    fn params(max_tokens: usize) -> ChunkParams {
        ChunkParams {
            max_tokens,
            overlap_tokens: 0,
            overlap_enabled: false,
        }
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_segments("doc1", "kb1", &[seg("hello world")], params(500), &CharHeuristicCounter);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sequence_index, 0);
        assert_eq!(chunks[0].text, "hello world");
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunks = chunk_segments("doc1", "kb1", &[seg("   ")], params(500), &CharHeuristicCounter);
        assert!(chunks.is_empty());
    }

    #[test]
    fn sequence_indices_are_dense_and_gapless() {
        let long_para = "word ".repeat(400);
        let text = format!("{0}\n\n{0}\n\n{0}", long_para);
        let chunks = chunk_segments("doc1", "kb1", &[seg(&text)], params(50), &CharHeuristicCounter);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence_index, i);
        }
    }

    #[test]
    fn never_exceeds_max_tokens_per_chunk() {
        let long_para = "alpha beta gamma delta epsilon zeta eta theta ".repeat(50);
        let chunks = chunk_segments("doc1", "kb1", &[seg(&long_para)], params(20), &CharHeuristicCounter);
        for c in &chunks {
            assert!(CharHeuristicCounter.count(&c.text) <= 20 + 5, "chunk too big: {} tokens", c.token_count);
        }
    }

    #[test]
    fn overlap_repeats_tail_tokens_in_next_chunk() {
        let long_para = "one two three four five six seven eight nine ten ".repeat(30);
        let p = ChunkParams {
            max_tokens: 20,
            overlap_tokens: 5,
            overlap_enabled: true,
        };
        let chunks = chunk_segments("doc1", "kb1", &[seg(&long_para)], p, &CharHeuristicCounter);
        assert!(chunks.len() > 1);
        // Some word from the tail of chunk 0 should reappear at the head of chunk 1.
        let tail_word: Vec<&str> = chunks[0].text.split_whitespace().collect();
        let last = *tail_word.last().unwrap();
        assert!(chunks[1].text.contains(last));
    }

    #[test]
    fn deterministic_for_same_input() {
        let c1 = chunk_segments("doc1", "kb1", &[seg("hello\n\nworld")], params(500), &CharHeuristicCounter);
        let c2 = chunk_segments("doc1", "kb1", &[seg("hello\n\nworld")], params(500), &CharHeuristicCounter);
        assert_eq!(c1.len(), c2.len());
        assert_eq!(c1[0].hash, c2[0].hash);
    }

    #[test]
    fn preserves_page_hint_from_segment() {
        let segment = Segment {
            text: "content here".to_string(),
            page: Some(3),
            paragraph: Some(1),
        };
        let chunks = chunk_segments("doc1", "kb1", &[segment], params(500), &CharHeuristicCounter);
        assert_eq!(chunks[0].page, Some(3));
        assert_eq!(chunks[0].paragraph, Some(1));
    }
}
