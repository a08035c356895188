//! Overlapping text chunker.
//!
//! Splits a document body into ordered, overlapping spans bounded by a
//! configured window size. Split points prefer a newline or space near the
//! window edge so chunks end on natural boundaries. Every chunk inherits
//! the document's `source_id` and current `content_hash` — the unit of
//! indexing is the chunk, the unit of change detection is the document.

use crate::source::DocumentRecord;

/// A bounded text span of one document; the unit of indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub source_id: String,
    pub content_hash: String,
    /// Position within the document, contiguous from 0.
    pub ordinal: i64,
    pub text: String,
}

/// Split a document into overlapping chunks of at most `chunk_chars`
/// characters, each starting `chunk_chars - overlap_chars` after the
/// previous one. Empty bodies yield no chunks.
pub fn chunk_document(doc: &DocumentRecord, chunk_chars: usize, overlap_chars: usize) -> Vec<Chunk> {
    chunk_text(
        &doc.source_id,
        &doc.content_hash,
        &doc.body,
        chunk_chars,
        overlap_chars,
    )
}

pub fn chunk_text(
    source_id: &str,
    content_hash: &str,
    text: &str,
    chunk_chars: usize,
    overlap_chars: usize,
) -> Vec<Chunk> {
    assert!(overlap_chars < chunk_chars, "overlap must be smaller than window");

    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    // Work on char boundaries so multi-byte text never splits mid-character.
    let indices: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total_chars = indices.len() - 1;

    let mut chunks = Vec::new();
    let mut start_char = 0usize;
    let mut ordinal: i64 = 0;

    while start_char < total_chars {
        let hard_end = (start_char + chunk_chars).min(total_chars);

        // Prefer a newline, then a space, in the back half of the window.
        let end_char = if hard_end < total_chars {
            let window = &text[indices[start_char]..indices[hard_end]];
            let min_len = chunk_chars / 2;
            window
                .rfind('\n')
                .or_else(|| window.rfind(' '))
                .map(|byte_pos| start_char + window[..byte_pos].chars().count() + 1)
                .filter(|&e| e > start_char + min_len)
                .unwrap_or(hard_end)
        } else {
            hard_end
        };

        let piece = text[indices[start_char]..indices[end_char]].trim();
        if !piece.is_empty() {
            chunks.push(Chunk {
                source_id: source_id.to_string(),
                content_hash: content_hash.to_string(),
                ordinal,
                text: piece.to_string(),
            });
            ordinal += 1;
        }

        if end_char >= total_chars {
            break;
        }
        // Overlap is taken from the realized end, so consecutive chunks
        // share their boundary text even after a soft split.
        start_char = end_char.saturating_sub(overlap_chars).max(start_char + 1);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc.md", "h1", "Hello, world!", 100, 20);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].source_id, "doc.md");
        assert_eq!(chunks[0].content_hash, "h1");
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk_text("doc.md", "h1", "", 100, 20).is_empty());
        assert!(chunk_text("doc.md", "h1", "   \n  ", 100, 20).is_empty());
    }

    #[test]
    fn test_ordinals_contiguous_from_zero() {
        let text = (0..40)
            .map(|i| format!("sentence number {}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text("doc.md", "h1", &text, 80, 20);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i as i64);
        }
    }

    #[test]
    fn test_chunks_overlap() {
        let text = "abcdefghij klmnopqrst uvwxyz0123 456789abcd efghijklmn";
        let chunks = chunk_text("doc.md", "h1", text, 20, 8);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let prev_tail: String = pair[0].text.chars().rev().take(4).collect();
            let tail: String = prev_tail.chars().rev().collect();
            assert!(
                pair[1].text.contains(tail.trim()),
                "chunk {:?} should overlap tail of {:?}",
                pair[1].text,
                pair[0].text
            );
        }
    }

    #[test]
    fn test_chunks_respect_window() {
        let text = "x".repeat(5000);
        let chunks = chunk_text("doc.md", "h1", &text, 1000, 200);
        for c in &chunks {
            assert!(c.text.chars().count() <= 1000);
        }
    }

    #[test]
    fn test_every_chunk_inherits_hash() {
        let text = "one two three ".repeat(50);
        let chunks = chunk_text("doc.md", "newhash", &text, 60, 10);
        assert!(chunks.iter().all(|c| c.content_hash == "newhash"));
        assert!(chunks.iter().all(|c| c.source_id == "doc.md"));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta gamma delta epsilon zeta eta theta ".repeat(10);
        let a = chunk_text("d", "h", &text, 70, 15);
        let b = chunk_text("d", "h", &text, 70, 15);
        assert_eq!(a, b);
    }

    #[test]
    fn test_multibyte_text_does_not_panic() {
        let text = "día café niño ".repeat(40);
        let chunks = chunk_text("d", "h", &text, 50, 10);
        assert!(!chunks.is_empty());
    }
}
