//! Orchestrator (§4.9): the end-to-end chat pipeline, turn serialization,
//! retry-with-expansion, and streaming fan-out with best-effort
//! persistence on client disconnect.

use crate::config::{RagConfig, TenantPersona};
use crate::error::RagError;
use crate::generator::{GenerationDelta, Generator};
use crate::llm::{ChatMessage, ChatProvider, GenerationConfig};
use crate::memory::ConversationMemory;
use crate::planner::{PlanDecision, Planner};
use crate::search::HybridRetriever;
use crate::types::{Message, RetrievalMetadata, ScoredChunk, SessionId, TenantId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

/// Persists turns. Schema and storage engine are a caller concern (§1);
/// this is only the seam the orchestrator writes through.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: Message);
}

pub struct Orchestrator {
    config: RagConfig,
    memory: Arc<ConversationMemory>,
    retriever: Arc<HybridRetriever>,
    chat_provider: Arc<dyn ChatProvider>,
    message_store: Arc<dyn MessageStore>,
    session_locks: DashMap<SessionId, Arc<AsyncMutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: RagConfig,
        memory: Arc<ConversationMemory>,
        retriever: Arc<HybridRetriever>,
        chat_provider: Arc<dyn ChatProvider>,
        message_store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            config,
            memory,
            retriever,
            chat_provider,
            message_store,
            session_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, session_id: &SessionId) -> Arc<AsyncMutex<()>> {
        self.session_locks.entry(session_id.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Runs one chat turn, serialized per session (§5), with a per-turn
    /// deadline. Deltas are pushed onto the returned channel as they are
    /// produced. Persistence happens inside the spawned task itself, so
    /// a caller dropping the receiver does not lose the turn — it only
    /// stops seeing further deltas.
    pub async fn chat(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        persona: TenantPersona,
        user_message: String,
    ) -> mpsc::Receiver<GenerationDelta> {
        let (tx, rx) = mpsc::channel(64);
        let lock = self.lock_for(&session_id);

        let config = self.config.clone();
        let memory = self.memory.clone();
        let retriever = self.retriever.clone();
        let chat_provider = self.chat_provider.clone();
        let message_store = self.message_store.clone();

        tokio::spawn(async move {
            let _guard = lock.lock().await;
            let deadline = std::time::Duration::from_secs(config.turn_deadline_secs);

            let run = Self::run_turn(
                &config,
                &memory,
                &retriever,
                chat_provider.clone(),
                &message_store,
                &tenant_id,
                &session_id,
                &persona,
                &user_message,
                tx,
            );

            match tokio::time::timeout(deadline, run).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(session_id = %session_id, error = %e, "chat turn failed"),
                Err(_) => tracing::warn!(session_id = %session_id, "chat turn exceeded deadline"),
            }
        });

        rx
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_turn(
        config: &RagConfig,
        memory: &ConversationMemory,
        retriever: &HybridRetriever,
        chat_provider: Arc<dyn ChatProvider>,
        message_store: &Arc<dyn MessageStore>,
        tenant_id: &TenantId,
        session_id: &SessionId,
        persona: &TenantPersona,
        user_message: &str,
        tx: mpsc::Sender<GenerationDelta>,
    ) -> Result<(), RagError> {
        let planner = Planner::new(chat_provider.clone());
        let generator = Generator::new(chat_provider.clone());

        let user_msg = Message::user(session_id.clone(), tenant_id.clone(), user_message.to_string());
        message_store.append(user_msg.clone()).await;
        memory.append(session_id, tenant_id, user_msg).await?;

        let (summary, recent) = memory.load(session_id).await;

        let decision = planner.classify_and_rewrite(user_message, summary.as_ref(), &recent).await;

        let (query_for_generation, chunks) = match decision {
            PlanDecision::Greeting | PlanDecision::Chitchat => (user_message.to_string(), Vec::new()),
            PlanDecision::Knowledge(rewritten) => {
                let chunks = Self::retrieve_with_retry(config, chat_provider.as_ref(), retriever, tenant_id, &rewritten).await?;
                (rewritten, chunks)
            }
            PlanDecision::Fallback => {
                let chunks = Self::retrieve_with_retry(config, chat_provider.as_ref(), retriever, tenant_id, user_message).await?;
                (user_message.to_string(), chunks)
            }
        };

        let message_id = uuid::Uuid::new_v4().to_string();
        let full_text = generator
            .generate(persona, &query_for_generation, &chunks, summary.as_ref(), &recent, message_id, |delta| {
                let _ = tx.try_send(delta);
            })
            .await?;

        let used_chunk_ids = Generator::extract_cited_chunk_ids(&full_text, &chunks);
        let retrieval_metadata = if used_chunk_ids.is_empty() {
            None
        } else {
            Some(RetrievalMetadata { chunk_ids: used_chunk_ids, rewritten_query: Some(query_for_generation) })
        };

        let assistant_msg = Message::assistant(session_id.clone(), tenant_id.clone(), full_text, retrieval_metadata);
        message_store.append(assistant_msg.clone()).await;
        memory.append(session_id, tenant_id, assistant_msg).await?;

        Ok(())
    }

    /// §4.9 step 5: on zero chunks, expand the query into 2-3
    /// paraphrases via one chat-model call, union-retrieve RRF-level
    /// candidates across them (stopping short of re-rank per paraphrase),
    /// dedupe by chunk_id keeping the max RRF score, then re-run the
    /// pipeline from §4.5 step 4 with a single re-rank call over the
    /// merged set.
    async fn retrieve_with_retry(
        config: &RagConfig,
        chat_provider: &dyn ChatProvider,
        retriever: &HybridRetriever,
        tenant_id: &TenantId,
        query: &str,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        let chunks = retriever
            .retrieve(tenant_id, query, config.retrieval_top_k, config.rerank_top_k, config.final_top_k)
            .await?;
        if !chunks.is_empty() || !config.enable_query_expansion || config.max_retries == 0 {
            return Ok(chunks);
        }

        let paraphrases = Self::expand_query(chat_provider, query).await;
        let mut by_chunk: HashMap<String, ScoredChunk> = HashMap::new();
        for paraphrase in &paraphrases {
            let hits = retriever
                .retrieve_candidates(tenant_id, paraphrase, config.retrieval_top_k, config.rerank_top_k)
                .await?;
            for hit in hits {
                by_chunk
                    .entry(hit.chunk_id.clone())
                    .and_modify(|existing| {
                        if hit.score > existing.score {
                            *existing = hit.clone();
                        }
                    })
                    .or_insert(hit);
            }
        }

        let mut merged: Vec<ScoredChunk> = by_chunk.into_values().collect();
        merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
        merged.truncate(config.rerank_top_k);

        Ok(retriever.rerank_and_finalize(query, merged, config.final_top_k).await)
    }

    /// One chat-model call producing 2-3 paraphrases. Falls back to the
    /// original query alone on any failure — an unhelpful expansion
    /// round costs latency, not correctness.
    async fn expand_query(chat_provider: &dyn ChatProvider, query: &str) -> Vec<String> {
        let prompt = format!(
            "Produce 2 to 3 paraphrases of the following question that preserve its \
             meaning but vary word choice and phrasing, to widen a search retry. \
             Respond with a JSON array of strings only.\n\nQuestion: \"{query}\""
        );
        let messages = [ChatMessage::user(prompt)];
        let config = GenerationConfig {
            max_tokens: 256,
            temperature: 0.5,
            json_schema: None,
            deadline: std::time::Duration::from_secs(10),
        };

        let raw = match chat_provider.generate(&messages, &config).await {
            Ok(text) => text,
            Err(_) => return vec![query.to_string()],
        };

        let trimmed = raw.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```").trim();
        match serde_json::from_str::<Vec<String>>(trimmed) {
            Ok(paraphrases) if !paraphrases.is_empty() => paraphrases,
            _ => vec![query.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubProvider;
    #[async_trait]
    impl ChatProvider for StubProvider {
        async fn generate(&self, _messages: &[ChatMessage], _config: &GenerationConfig) -> Result<String, RagError> {
            Ok(r#"["paraphrase one", "paraphrase two"]"#.to_string())
        }
        async fn generate_stream(&self, _messages: &[ChatMessage], _config: &GenerationConfig) -> Result<crate::llm::TokenStream, RagError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn expand_query_parses_json_array() {
        let provider = StubProvider;
        let paraphrases = Orchestrator::expand_query(&provider, "original").await;
        assert_eq!(paraphrases, vec!["paraphrase one".to_string(), "paraphrase two".to_string()]);
    }
}
