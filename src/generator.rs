//! Generator (§4.8): prompt assembly and streaming answer synthesis.
//!
//! Citation parsing reuses a `\[(\d+)\]` pattern compiled once with
//! `LazyLock`, same as other regex-driven passes in this codebase.

use crate::config::TenantPersona;
use crate::llm::{ChatMessage, ChatProvider, GenerationConfig};
use crate::types::{MemorySummary, Message, ScoredChunk};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

static CITATION_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\[(\d+)\]").expect("citation regex is valid"));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationDelta {
    TextDelta { text: String },
    SourceDelta { chunk_id: String, source_filename: String, page: Option<u32>, ordinal: u32 },
    End { message_id: String },
}

pub struct Generator {
    chat_provider: Arc<dyn ChatProvider>,
}

impl Generator {
    pub fn new(chat_provider: Arc<dyn ChatProvider>) -> Self {
        Self { chat_provider }
    }

    fn system_preamble(persona: &TenantPersona, has_context: bool) -> String {
        let today = chrono::Utc::now().format("%Y-%m-%d");
        let languages = persona.languages.join(", ");
        let capabilities = persona.capabilities.join(", ");
        let constraints = persona.constraints.join("; ");

        let instruction = if has_context {
            "Answer only using the numbered context below. Cite the chunks you used with \
             their bracketed numbers, e.g. [1]. If the answer is not contained in the \
             context, say plainly that the corpus does not cover the question."
        } else {
            "No relevant context was found in the corpus for this question. Say plainly \
             that the corpus does not cover the question; do not invent an answer."
        };

        format!(
            "You are a support assistant for a business in the {industry} industry. \
             Brand tone: {tone}. Permitted languages: {languages}. Capabilities: {capabilities}. \
             Constraints: {constraints}. Today's date is {today}.\n\n{instruction}",
            industry = persona.industry,
            tone = persona.brand_tone,
        )
    }

    fn context_block(chunks: &[ScoredChunk]) -> String {
        chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let page = c.metadata.page.map(|p| format!(", page {p}")).unwrap_or_default();
                format!("[{}] (source: {}{}) {}", i + 1, c.metadata.source_filename, page, c.text)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn build_messages(
        persona: &TenantPersona,
        query: &str,
        chunks: &[ScoredChunk],
        summary: Option<&MemorySummary>,
        recent: &[Message],
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(Self::system_preamble(persona, !chunks.is_empty()))];

        if let Some(summary) = summary {
            messages.push(ChatMessage::system(format!("Conversation summary so far: {}", summary.summary_text)));
        }

        for m in recent {
            match m.role {
                crate::types::Role::User => messages.push(ChatMessage::user(m.content.clone())),
                crate::types::Role::Assistant => messages.push(ChatMessage::assistant(m.content.clone())),
            }
        }

        if !chunks.is_empty() {
            messages.push(ChatMessage::system(format!("Context:\n{}", Self::context_block(chunks))));
        }

        messages.push(ChatMessage::user(query.to_string()));
        messages
    }

    /// Stream the answer: text deltas as tokens arrive, then one
    /// `SourceDelta` per cited chunk (deduplicated by chunk_id), then
    /// `End`. Unknown citation numbers are silently dropped (§4.8).
    pub async fn generate(
        &self,
        persona: &TenantPersona,
        query: &str,
        chunks: &[ScoredChunk],
        summary: Option<&MemorySummary>,
        recent: &[Message],
        message_id: String,
        mut on_delta: impl FnMut(GenerationDelta),
    ) -> Result<String, crate::error::RagError> {
        let messages = Self::build_messages(persona, query, chunks, summary, recent);
        let config = GenerationConfig::default();

        let mut stream = self.chat_provider.generate_stream(&messages, &config).await?;
        let mut full_text = String::new();
        while let Some(token) = stream.next().await {
            full_text.push_str(&token);
            on_delta(GenerationDelta::TextDelta { text: token });
        }

        for chunk_id in Self::extract_cited_chunk_ids(&full_text, chunks) {
            let chunk = chunks.iter().find(|c| c.chunk_id == chunk_id).expect("cited index is in range");
            on_delta(GenerationDelta::SourceDelta {
                chunk_id: chunk.chunk_id.clone(),
                source_filename: chunk.metadata.source_filename.clone(),
                page: chunk.metadata.page,
                ordinal: chunk.metadata.ordinal,
            });
        }

        on_delta(GenerationDelta::End { message_id });
        Ok(full_text)
    }

    /// Map `[n]` tokens in `text` to chunk_ids by position in the
    /// context block (1-indexed), deduplicated and in first-seen order.
    pub fn extract_cited_chunk_ids(text: &str, chunks: &[ScoredChunk]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for capture in CITATION_RE.captures_iter(text) {
            let Ok(n) = capture[1].parse::<usize>() else {
                continue;
            };
            if n == 0 || n > chunks.len() {
                continue;
            }
            let chunk_id = chunks[n - 1].chunk_id.clone();
            if seen.insert(chunk_id.clone()) {
                ids.push(chunk_id);
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkMetadata;

    fn chunk(id: &str, source: &str) -> ScoredChunk {
        ScoredChunk {
            chunk_id: id.to_string(),
            document_id: "d1".to_string(),
            tenant_id: "t1".to_string(),
            text: "some text".to_string(),
            metadata: ChunkMetadata { source_filename: source.to_string(), page: None, ordinal: 0 },
            score: 1.0,
        }
    }

    #[test]
    fn extracts_valid_citations_in_first_seen_order() {
        let chunks = vec![chunk("a", "a.txt"), chunk("b", "b.txt"), chunk("c", "c.txt")];
        let text = "According to [2] and [1], also [2] again.";
        let ids = Generator::extract_cited_chunk_ids(text, &chunks);
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn drops_out_of_range_citations() {
        let chunks = vec![chunk("a", "a.txt")];
        let text = "See [1] and [5] and [0].";
        let ids = Generator::extract_cited_chunk_ids(text, &chunks);
        assert_eq!(ids, vec!["a".to_string()]);
    }

    #[test]
    fn no_citations_returns_empty() {
        let chunks = vec![chunk("a", "a.txt")];
        let ids = Generator::extract_cited_chunk_ids("no citations here", &chunks);
        assert!(ids.is_empty());
    }
}
