use serde::{Deserialize, Serialize};

/// Embedding models bill by token; chunk budgets are given in tokens and
/// approximated in characters at this ratio.
pub const CHARS_PER_TOKEN: usize = 4;
pub const DEFAULT_CHUNK_SIZE_TOKENS: usize = 500;
pub const DEFAULT_CHUNK_OVERLAP_TOKENS: usize = 50;

// Sentence-boundary search window around the naive cut point, in characters.
const BOUNDARY_LOOKBACK: usize = 200;
const BOUNDARY_LOOKAHEAD: usize = 100;
const BOUNDARY_OVERSHOOT: usize = 50;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub content: String,
    pub index: usize,
}

/// Collapses all runs of whitespace to single spaces and trims the ends.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Splits `text` into overlapping, sentence-aligned chunks of roughly
/// `chunk_size_tokens` tokens. Deterministic: the same input always produces
/// the same spans.
pub fn chunk_text(text: &str, chunk_size_tokens: usize, overlap_tokens: usize) -> Vec<ChunkSpan> {
    let cleaned = clean_text(text);
    if cleaned.is_empty() {
        return vec![];
    }

    let target_chars = chunk_size_tokens * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    let chars: Vec<char> = cleaned.chars().collect();

    if chars.len() <= target_chars {
        return vec![ChunkSpan {
            content: cleaned,
            index: 0,
        }];
    }

    let mut chunks: Vec<ChunkSpan> = vec![];
    let mut start = 0usize;
    let mut chunk_index = 0usize;

    while start < chars.len() {
        let naive_end = start + target_chars;
        let end = if naive_end >= chars.len() {
            chars.len()
        } else {
            find_cut_point(&chars, start, naive_end)
        };

        let content: String = chars[start..end]
            .iter()
            .collect::<String>()
            .trim()
            .to_string();
        if !content.is_empty() {
            chunks.push(ChunkSpan {
                content,
                index: chunk_index,
            });
            chunk_index += 1;
        }

        if end >= chars.len() {
            break;
        }

        let next_start = end.saturating_sub(overlap_chars);
        // overlap must never stall the window
        start = if next_start <= start { end } else { next_start };
    }

    chunks
}

/// Picks the cut point for a window ending at `target_end`: the nearest
/// sentence end within the search window, else the nearest preceding word
/// boundary, else `target_end` itself.
fn find_cut_point(chars: &[char], start: usize, target_end: usize) -> usize {
    let search_start = target_end.saturating_sub(BOUNDARY_LOOKBACK).max(start);
    let search_end = (target_end + BOUNDARY_LOOKAHEAD).min(chars.len());

    let mut sentence_end: Option<usize> = None;
    for pos in search_start..search_end.saturating_sub(1) {
        if matches!(chars[pos], '.' | '!' | '?')
            && chars[pos + 1].is_whitespace()
            && pos + 1 <= target_end + BOUNDARY_OVERSHOOT
        {
            sentence_end = Some(pos + 1);
        }
    }
    if let Some(pos) = sentence_end {
        return pos;
    }

    let mut pos = target_end.min(chars.len() - 1);
    while pos > start {
        if chars[pos].is_whitespace() {
            return pos;
        }
        pos -= 1;
    }

    target_end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text(sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("Sentence number {} talks about the product in some detail.", i))
            .collect::<Vec<String>>()
            .join(" ")
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", 500, 50).is_empty());
        assert!(chunk_text("   \n\t  ", 500, 50).is_empty());
    }

    #[test]
    fn short_input_yields_single_chunk() {
        let chunks = chunk_text("Just one short paragraph.", 500, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].content, "Just one short paragraph.");
    }

    #[test]
    fn normalizes_whitespace_before_chunking() {
        let chunks = chunk_text("hello \n\n\n   world\t!", 500, 50);
        assert_eq!(chunks[0].content, "hello world !");
    }

    #[test]
    fn long_input_produces_ordered_bounded_chunks() {
        let text = sample_text(200);
        let chunks = chunk_text(&text, 100, 10);

        assert!(chunks.len() > 1);
        let max_chars = 100 * CHARS_PER_TOKEN + BOUNDARY_OVERSHOOT + 1;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert!(!chunk.content.is_empty());
            assert!(chunk.content.chars().count() <= max_chars);
        }
    }

    #[test]
    fn chunks_cover_start_and_end_of_text() {
        let text = sample_text(120);
        let normalized = clean_text(&text);
        let chunks = chunk_text(&text, 100, 10);

        assert!(normalized.starts_with(&chunks[0].content));
        let last = &chunks[chunks.len() - 1].content;
        assert!(normalized.ends_with(last.as_str()));
        for chunk in &chunks {
            assert!(normalized.contains(&chunk.content));
        }
    }

    #[test]
    fn prefers_sentence_boundaries() {
        let text = sample_text(120);
        let chunks = chunk_text(&text, 100, 10);

        // every non-final chunk should have been cut at a sentence end
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(
                chunk.content.ends_with('.'),
                "chunk did not end at a sentence: {:?}",
                &chunk.content[chunk.content.len().saturating_sub(40)..]
            );
        }
    }

    #[test]
    fn falls_back_to_word_boundary_without_sentences() {
        let text = (0..600)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, 50, 5);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(!chunk.content.starts_with(' '));
            assert!(!chunk.content.ends_with(' '));
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = sample_text(150);
        assert_eq!(chunk_text(&text, 100, 10), chunk_text(&text, 100, 10));
    }

    #[test]
    fn single_unbreakable_token_still_terminates() {
        let text = "x".repeat(5000);
        let chunks = chunk_text(&text, 100, 10);
        assert!(!chunks.is_empty());
        let total: usize = chunks.iter().map(|c| c.content.len()).sum();
        assert!(total >= 5000);
    }
}
