//! Hybrid retriever (§4.5): parallel vector + lexical search, Reciprocal
//! Rank Fusion, optional LLM re-rank.

use super::rerank::llm_rerank;
use crate::embeddings::Embedder;
use crate::error::RagError;
use crate::index::{LexicalIndex, VectorIndex};
use crate::llm::ChatProvider;
use crate::types::{ChunkId, ScoredChunk, TenantId};
use std::collections::HashMap;
use std::sync::Arc;

const RRF_K: f32 = 60.0;

pub struct HybridRetriever {
    embedder: Arc<dyn Embedder>,
    vector_index: Arc<dyn VectorIndex>,
    lexical_index: Arc<LexicalIndex>,
    chat_provider: Arc<dyn ChatProvider>,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vector_index: Arc<dyn VectorIndex>,
        lexical_index: Arc<LexicalIndex>,
        chat_provider: Arc<dyn ChatProvider>,
    ) -> Self {
        Self {
            embedder,
            vector_index,
            lexical_index,
            chat_provider,
        }
    }

    /// Fuse two already-ranked lists via RRF, summing `1/(K+rank)` per
    /// candidate and breaking ties by chunk_id ascending. `rank` is
    /// 1-indexed per §4.5.
    pub fn fuse(lists: &[&[ScoredChunk]], top_k: usize) -> Vec<ScoredChunk> {
        let mut fused: HashMap<ChunkId, (f32, ScoredChunk)> = HashMap::new();
        for list in lists {
            for (i, chunk) in list.iter().enumerate() {
                let rank = (i + 1) as f32;
                let contribution = 1.0 / (RRF_K + rank);
                fused
                    .entry(chunk.chunk_id.clone())
                    .and_modify(|(score, _)| *score += contribution)
                    .or_insert_with(|| (contribution, chunk.clone()));
            }
        }

        let mut merged: Vec<ScoredChunk> = fused
            .into_values()
            .map(|(score, mut chunk)| {
                chunk.score = score;
                chunk
            })
            .collect();

        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        merged.truncate(top_k);
        merged
    }

    /// §4.5 steps 1-3: embed, dual search, RRF fusion. Stops short of the
    /// LLM re-rank so a caller merging candidates across several queries
    /// (the orchestrator's retry-with-expansion, §4.9 step 5) can dedupe
    /// RRF-level candidates before paying for a single re-rank call,
    /// rather than re-ranking once per query.
    pub async fn retrieve_candidates(
        &self,
        tenant_id: &TenantId,
        query: &str,
        retrieval_top_k: usize,
        rerank_top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        let (query_vectors, _warnings) = self.embedder.embed(&[query.to_string()]).await?;
        let query_vector = query_vectors.into_iter().next().ok_or_else(|| RagError::Other(anyhow::anyhow!("embedder returned no vectors")))?;

        let (vector_hits, lexical_hits) = tokio::join!(
            self.vector_index.search(tenant_id, &query_vector, retrieval_top_k),
            self.lexical_index.search(tenant_id, query, retrieval_top_k),
        );
        let vector_hits = vector_hits?;
        let lexical_hits = lexical_hits?;

        Ok(Self::fuse(&[&vector_hits, &lexical_hits], rerank_top_k))
    }

    /// §4.5 step 4-5: one batched LLM re-rank call over already-fused
    /// candidates, truncated to `final_top_k`. Candidates presented to
    /// the re-ranker should already be query-relevant; the `query` here
    /// is only used to build the re-rank prompt.
    pub async fn rerank_and_finalize(&self, query: &str, candidates: Vec<ScoredChunk>, final_top_k: usize) -> Vec<ScoredChunk> {
        if candidates.is_empty() {
            return candidates;
        }
        let mut reranked = llm_rerank(self.chat_provider.as_ref(), query, candidates).await;
        reranked.truncate(final_top_k);
        reranked
    }

    /// §4.5 steps 1-5 end to end for a single query: embed, dual search,
    /// RRF fusion, LLM re-rank, return top `final_top_k`. An empty
    /// `retrieval_top_k` result from both indices yields an empty list —
    /// retry policy lives in the orchestrator, not here.
    pub async fn retrieve(
        &self,
        tenant_id: &TenantId,
        query: &str,
        retrieval_top_k: usize,
        rerank_top_k: usize,
        final_top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        let fused = self.retrieve_candidates(tenant_id, query, retrieval_top_k, rerank_top_k).await?;
        Ok(self.rerank_and_finalize(query, fused, final_top_k).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkMetadata;

    fn chunk(id: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk_id: id.to_string(),
            document_id: "d1".to_string(),
            tenant_id: "t1".to_string(),
            text: format!("text for {id}"),
            metadata: ChunkMetadata::default(),
            score,
        }
    }

    #[test]
    fn fuse_sums_contributions_for_candidates_in_both_lists() {
        let vector = vec![chunk("a", 0.9), chunk("b", 0.8)];
        let lexical = vec![chunk("b", 5.0), chunk("a", 4.0)];
        let fused = HybridRetriever::fuse(&[&vector, &lexical], 10);
        assert_eq!(fused.len(), 2);
        // "a" is rank 1 in both lists; "b" is rank 2 in vector, rank 1 in lexical.
        // a: 1/61 + 1/61 = 2/61 ; b: 1/62 + 1/61
        assert!(fused[0].chunk_id == "a" || fused[0].chunk_id == "b");
    }

    #[test]
    fn fuse_breaks_ties_by_chunk_id_ascending() {
        let vector = vec![chunk("z", 1.0)];
        let lexical = vec![chunk("a", 1.0)];
        let fused = HybridRetriever::fuse(&[&vector, &lexical], 10);
        assert_eq!(fused[0].chunk_id, "a");
        assert_eq!(fused[1].chunk_id, "z");
    }

    #[test]
    fn fuse_respects_top_k_truncation() {
        let vector: Vec<ScoredChunk> = (0..5).map(|i| chunk(&format!("c{i}"), 1.0)).collect();
        let fused = HybridRetriever::fuse(&[&vector, &[]], 3);
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn fuse_of_empty_lists_is_empty() {
        let fused = HybridRetriever::fuse(&[&[], &[]], 10);
        assert!(fused.is_empty());
    }
}
