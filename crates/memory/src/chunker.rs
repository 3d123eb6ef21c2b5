/// Line-oriented markdown chunking with overlap.
use sha2::{Digest, Sha256};

use crate::tokens::TokenEstimator;

/// Smallest chunk size in characters, whatever the token settings say.
const MIN_CHUNK_CHARS: usize = 32;

/// A chunk of a source document before it is embedded and stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub hash: String,
    pub token_count: usize,
}

/// SHA-256 hex digest of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split `content` into chunks of roughly `chunk_tokens` tokens, carrying
/// the trailing `overlap_tokens` worth of lines into the next chunk.
pub fn chunk_markdown(
    content: &str,
    chunk_tokens: usize,
    overlap_tokens: usize,
    estimator: &TokenEstimator,
) -> Vec<TextChunk> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let max_chars = estimator.char_budget(chunk_tokens).max(MIN_CHUNK_CHARS);
    let overlap_chars = estimator.char_budget(overlap_tokens).min(max_chars / 2);

    let mut chunks = Vec::new();
    // (segment text, 1-based line number, size in chars including newline)
    let mut current: Vec<(&str, usize, usize)> = Vec::new();
    let mut current_chars = 0usize;

    for (idx, line) in content.split('\n').enumerate() {
        let line_no = idx + 1;
        for segment in split_long_line(line, max_chars) {
            let size = segment.chars().count() + 1;
            if current_chars + size > max_chars && !current.is_empty() {
                flush(&current, &mut chunks, estimator);
                carry_overlap(&mut current, &mut current_chars, overlap_chars);
                if current_chars + size > max_chars {
                    // The carried overlap alone would be re-emitted as a chunk.
                    current.clear();
                    current_chars = 0;
                }
            }
            current.push((segment, line_no, size));
            current_chars += size;
        }
    }
    flush(&current, &mut chunks, estimator);
    chunks
}

fn split_long_line(line: &str, max_chars: usize) -> Vec<&str> {
    if line.chars().count() <= max_chars {
        return vec![line];
    }
    let mut segments = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (byte_idx, _) in line.char_indices() {
        if count == max_chars {
            segments.push(&line[start..byte_idx]);
            start = byte_idx;
            count = 0;
        }
        count += 1;
    }
    segments.push(&line[start..]);
    segments
}

fn flush(current: &[(&str, usize, usize)], chunks: &mut Vec<TextChunk>, est: &TokenEstimator) {
    let (Some(first), Some(last)) = (current.first(), current.last()) else {
        return;
    };
    let text = current
        .iter()
        .map(|(segment, ..)| *segment)
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return;
    }
    chunks.push(TextChunk {
        start_line: first.1,
        end_line: last.1,
        hash: hash_text(&text),
        token_count: est.estimate(&text),
        text,
    });
}

fn carry_overlap(
    current: &mut Vec<(&str, usize, usize)>,
    current_chars: &mut usize,
    overlap_chars: usize,
) {
    if overlap_chars == 0 {
        current.clear();
        *current_chars = 0;
        return;
    }
    let mut kept = 0usize;
    let mut acc = 0usize;
    for item in current.iter().rev() {
        if acc + item.2 > overlap_chars {
            break;
        }
        acc += item.2;
        kept += 1;
    }
    current.drain(..current.len() - kept);
    *current_chars = acc;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn est() -> TokenEstimator {
        TokenEstimator::new(4.0)
    }

    #[test]
    fn empty_content_has_no_chunks() {
        assert!(chunk_markdown("", 100, 10, &est()).is_empty());
        assert!(chunk_markdown("  \n\n ", 100, 10, &est()).is_empty());
    }

    #[test]
    fn small_document_is_one_chunk() {
        let chunks = chunk_markdown("# Title\n\nSome text.", 100, 10, &est());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
        assert_eq!(chunks[0].hash, hash_text("# Title\n\nSome text."));
    }

    #[test]
    fn splits_on_budget_with_overlap() {
        // 40 lines of 19 chars (+1 newline) = 800 chars; budget 50 tokens * 4 = 200 chars.
        let content = (0..40)
            .map(|i| format!("line number {i:07}"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_markdown(&content, 50, 10, &est());
        assert!(chunks.len() > 3);
        for c in &chunks {
            assert!(c.text.chars().count() <= 200);
        }
        // Overlap: each chunk after the first starts before the previous one ends.
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line <= pair[0].end_line);
            assert!(pair[1].end_line > pair[0].end_line);
        }
        assert_eq!(chunks.last().map(|c| c.end_line), Some(40));
    }

    #[test]
    fn no_overlap_partitions_lines() {
        let content = (0..20)
            .map(|i| format!("entry {i:013}"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_markdown(&content, 20, 0, &est());
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start_line, pair[0].end_line + 1);
        }
    }

    #[test]
    fn long_line_is_split_on_char_boundaries() {
        let line = "é".repeat(100);
        let chunks = chunk_markdown(&line, 10, 0, &est());
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.start_line == 1 && c.end_line == 1));
        let total: usize = chunks.iter().map(|c| c.text.chars().count()).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn chunking_is_deterministic() {
        let content = "alpha\nbeta\ngamma\n".repeat(50);
        let a = chunk_markdown(&content, 30, 5, &est());
        let b = chunk_markdown(&content, 30, 5, &est());
        assert_eq!(a, b);
    }
}
