//! Token-aware sliding-window chunker (§4.1).
//!
//! A sentence-aware sliding window, generalised from a byte-counting
//! window to a token-counting one, since chunk size here is specified in
//! tokens compatible with the embedding model. Because the embedding
//! model's own tokenizer is an external collaborator (out of scope, §1),
//! token boundaries are approximated with a lightweight word/punctuation
//! splitter that always tracks byte offsets into the original text, so
//! chunk text is a verbatim substring — never re-joined or re-escaped.

use crate::types::{Chunk, ChunkMetadata, DocumentId, TenantId};

/// One token's byte span `[start, end)` within the source text.
#[derive(Debug, Clone, Copy)]
struct TokenSpan {
    start: usize,
    end: usize,
}

/// A chunked span of the source text, before it is wrapped into a
/// [`Chunk`] with a document/tenant identity.
#[derive(Debug, Clone)]
pub struct ChunkSpan {
    pub ordinal: u32,
    pub text: String,
    pub token_count: usize,
    pub start_offset: usize,
    pub end_offset: usize,
}

pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    /// Approximate tokenisation: maximal runs of alphanumeric characters
    /// are one token each; any other non-whitespace character is its own
    /// token. Whitespace is a separator, never part of a token.
    fn tokenize(text: &str) -> Vec<TokenSpan> {
        let mut spans = Vec::new();
        let mut iter = text.char_indices().peekable();
        while let Some((start, ch)) = iter.next() {
            if ch.is_whitespace() {
                continue;
            }
            if ch.is_alphanumeric() {
                let mut end = start + ch.len_utf8();
                while let Some(&(next_start, next_ch)) = iter.peek() {
                    if next_ch.is_alphanumeric() {
                        end = next_start + next_ch.len_utf8();
                        iter.next();
                    } else {
                        break;
                    }
                }
                spans.push(TokenSpan { start, end });
            } else {
                spans.push(TokenSpan {
                    start,
                    end: start + ch.len_utf8(),
                });
            }
        }
        spans
    }

    fn is_sentence_terminator(text: &str, span: TokenSpan) -> bool {
        matches!(&text[span.start..span.end], "." | "!" | "?")
    }

    /// Within the last 10% of `[start, end)` tokens, prefer to end the
    /// chunk just after a sentence terminator. Never moves `end` forward,
    /// and never moves it back past `start + 1` — so this can shrink a
    /// window but can never stall overall advancement.
    fn soft_sentence_boundary(text: &str, tokens: &[TokenSpan], start: usize, end: usize) -> usize {
        let window_len = end - start;
        let soft_region = window_len / 10;
        if soft_region == 0 {
            return end;
        }
        let region_start = end.saturating_sub(soft_region).max(start);
        for idx in (region_start..end).rev() {
            if Self::is_sentence_terminator(text, tokens[idx]) {
                let boundary = idx + 1;
                if boundary > start {
                    return boundary;
                }
            }
        }
        end
    }

    /// Split `text` into ordered chunk spans. Empty or whitespace-only
    /// input yields an empty list, not an error (§4.1).
    pub fn chunk(&self, text: &str) -> Vec<ChunkSpan> {
        let tokens = Self::tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }

        let n = tokens.len();
        let min_final_tokens = self.chunk_overlap.min(32);
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut start = 0usize;

        loop {
            let raw_end = (start + self.chunk_size).min(n);
            let is_final_window = raw_end == n;
            let end = if is_final_window {
                raw_end
            } else {
                Self::soft_sentence_boundary(text, &tokens, start, raw_end)
            };

            if is_final_window && !spans.is_empty() && end - start <= min_final_tokens {
                // Merge the short tail into the previous chunk rather than
                // emitting a near-empty trailing chunk.
                let last = spans.last_mut().expect("checked non-empty above");
                last.1 = end;
                break;
            }

            spans.push((start, end));

            if end >= n {
                break;
            }

            // Retreat by chunk_overlap, but guarantee forward progress so a
            // pathological soft boundary can never stall the loop.
            let retreated = end.saturating_sub(self.chunk_overlap);
            start = retreated.max(start + 1);
        }

        spans
            .into_iter()
            .enumerate()
            .map(|(ordinal, (tok_start, tok_end))| {
                let byte_start = tokens[tok_start].start;
                let byte_end = tokens[tok_end - 1].end;
                ChunkSpan {
                    ordinal: ordinal as u32,
                    text: text[byte_start..byte_end].to_string(),
                    token_count: tok_end - tok_start,
                    start_offset: byte_start,
                    end_offset: byte_end,
                }
            })
            .collect()
    }

    /// Convenience wrapper producing fully-identified [`Chunk`]s for a
    /// document, with deterministic chunk ids (§3).
    pub fn chunk_document(
        &self,
        document_id: &DocumentId,
        tenant_id: &TenantId,
        source_filename: &str,
        text: &str,
    ) -> Vec<Chunk> {
        self.chunk(text)
            .into_iter()
            .map(|span| Chunk {
                chunk_id: crate::types::derive_chunk_id(document_id, span.ordinal),
                document_id: document_id.clone(),
                tenant_id: tenant_id.clone(),
                ordinal: span.ordinal,
                text: span.text,
                token_count: span.token_count,
                metadata: ChunkMetadata {
                    source_filename: source_filename.to_string(),
                    page: None,
                    ordinal: span.ordinal,
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunker = TextChunker::new(512, 50);
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n\t  ").is_empty());
    }

    #[test]
    fn small_text_is_a_single_chunk() {
        let chunker = TextChunker::new(512, 50);
        let chunks = chunker.chunk("hello world, this is a short document.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "word ".repeat(2000);
        let chunker = TextChunker::new(512, 50);
        let first = chunker.chunk(&text);
        let second = chunker.chunk(&text);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.start_offset, b.start_offset);
            assert_eq!(a.end_offset, b.end_offset);
        }
    }

    #[test]
    fn ordinals_are_contiguous_from_zero() {
        let text = "word ".repeat(2000);
        let chunker = TextChunker::new(512, 50);
        let chunks = chunker.chunk(&text);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal as usize, i);
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "word ".repeat(2000);
        let chunker = TextChunker::new(512, 50);
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_offset < pair[0].end_offset, "chunks must overlap");
        }
    }

    #[test]
    fn chunk_ids_are_deterministic_given_document_id() {
        let chunker = TextChunker::new(512, 50);
        let text = "word ".repeat(2000);
        let doc_id = "doc-1".to_string();
        let tenant_id = "tenant-a".to_string();
        let first = chunker.chunk_document(&doc_id, &tenant_id, "a.txt", &text);
        let second = chunker.chunk_document(&doc_id, &tenant_id, "a.txt", &text);
        let first_ids: Vec<_> = first.iter().map(|c| c.chunk_id.clone()).collect();
        let second_ids: Vec<_> = second.iter().map(|c| c.chunk_id.clone()).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn no_infinite_loop_on_overlap_near_chunk_size() {
        // Overlap one below chunk_size still must terminate.
        let chunker = TextChunker::new(40, 39);
        let text = "word ".repeat(500);
        let chunks = chunker.chunk(&text);
        assert!(!chunks.is_empty());
    }
}
