//! Tenant-partitioned BM25 lexical index (§4.4).
//!
//! §6 calls for a custom `<tenant_id>.bm25` file format rather than an
//! external full-text engine's own index format, so the scoring and
//! persistence here are hand-rolled. The concurrency shape is a
//! `parking_lot`-guarded writer with readers served from a
//! last-committed in-memory snapshot, swapped atomically after a
//! successful disk write (§5's per-tenant single writer, many readers).

use crate::error::RagError;
use crate::types::{Chunk, ChunkId, ChunkMetadata, DocumentId, ScoredChunk, TenantId};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const FORMAT_VERSION: u8 = 1;
const K1: f32 = 1.5;
const B: f32 = 0.75;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with", "about", "after", "all", "also", "am", "any",
    "because", "been", "before", "between", "both", "can", "could", "did", "do", "does", "from",
    "had", "has", "have", "he", "her", "him", "his", "how", "i", "its", "me", "my", "off", "our",
    "out", "over", "she", "so", "some", "than", "them", "up", "we", "what", "when", "where",
    "which", "who", "why", "you", "your",
];

fn tokenizer_config_hash() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    STOPWORDS.hash(&mut hasher);
    K1.to_bits().hash(&mut hasher);
    B.to_bits().hash(&mut hasher);
    hasher.finish()
}

/// Unicode-aware lowercase, punctuation-stripped, stopword-filtered
/// tokenisation. No stemming (§4.4).
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkEntry {
    document_id: DocumentId,
    text: String,
    metadata: ChunkMetadata,
    term_frequencies: HashMap<String, u32>,
    length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct TenantIndexData {
    doc_frequency: HashMap<String, u32>,
    chunks: HashMap<ChunkId, ChunkEntry>,
    total_length: u64,
}

impl TenantIndexData {
    fn avg_length(&self) -> f32 {
        if self.chunks.is_empty() {
            0.0
        } else {
            self.total_length as f32 / self.chunks.len() as f32
        }
    }

    fn remove_chunk(&mut self, chunk_id: &str) {
        if let Some(entry) = self.chunks.remove(chunk_id) {
            self.total_length -= entry.length as u64;
            for term in entry.term_frequencies.keys() {
                if let Some(df) = self.doc_frequency.get_mut(term) {
                    *df = df.saturating_sub(1);
                    if *df == 0 {
                        self.doc_frequency.remove(term);
                    }
                }
            }
        }
    }

    fn insert_chunk(&mut self, chunk: &Chunk) {
        self.remove_chunk(&chunk.chunk_id);
        let tokens = tokenize(&chunk.text);
        let length = tokens.len() as u32;
        let mut term_frequencies: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *term_frequencies.entry(token).or_insert(0) += 1;
        }
        for term in term_frequencies.keys() {
            *self.doc_frequency.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_length += length as u64;
        self.chunks.insert(
            chunk.chunk_id.clone(),
            ChunkEntry {
                document_id: chunk.document_id.clone(),
                text: chunk.text.clone(),
                metadata: chunk.metadata.clone(),
                term_frequencies,
                length,
            },
        );
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.chunks.len() as f32;
        let df = *self.doc_frequency.get(term).unwrap_or(&0) as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn score(&self, chunk_id: &str, query_terms: &[String]) -> f32 {
        let Some(entry) = self.chunks.get(chunk_id) else {
            return 0.0;
        };
        let avgdl = self.avg_length().max(1.0);
        query_terms
            .iter()
            .map(|term| {
                let tf = *entry.term_frequencies.get(term).unwrap_or(&0) as f32;
                if tf == 0.0 {
                    return 0.0;
                }
                let idf = self.idf(term);
                let denom = tf + K1 * (1.0 - B + B * entry.length as f32 / avgdl);
                idf * (tf * (K1 + 1.0)) / denom
            })
            .sum()
    }

    fn search(&self, tenant_id: &TenantId, query: &str, k: usize) -> Vec<ScoredChunk> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(String, f32)> = self
            .chunks
            .keys()
            .map(|chunk_id| (chunk_id.clone(), self.score(chunk_id, &query_terms)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(chunk_id, score)| {
                let entry = &self.chunks[&chunk_id];
                ScoredChunk {
                    chunk_id,
                    document_id: entry.document_id.clone(),
                    tenant_id: tenant_id.clone(),
                    text: entry.text.clone(),
                    metadata: entry.metadata.clone(),
                    score,
                }
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedFile {
    tokenizer_config_hash: u64,
    data: TenantIndexData,
}

struct TenantState {
    write_lock: tokio::sync::Mutex<()>,
    snapshot: RwLock<Arc<TenantIndexData>>,
}

pub struct LexicalIndex {
    dir: PathBuf,
    tenants: DashMap<TenantId, Arc<TenantState>>,
}

impl LexicalIndex {
    pub fn new(dir: PathBuf) -> Self {
        std::fs::create_dir_all(&dir).ok();
        Self {
            dir,
            tenants: DashMap::new(),
        }
    }

    fn file_path(&self, tenant_id: &str) -> PathBuf {
        self.dir.join(format!("{tenant_id}.bm25"))
    }

    fn load_from_disk(&self, tenant_id: &str) -> TenantIndexData {
        let path = self.file_path(tenant_id);
        let Ok(bytes) = std::fs::read(&path) else {
            return TenantIndexData::default();
        };
        if bytes.is_empty() || bytes[0] != FORMAT_VERSION {
            tracing::warn!(tenant_id, "unrecognised bm25 file version, starting fresh");
            return TenantIndexData::default();
        }
        match serde_json::from_slice::<PersistedFile>(&bytes[1..]) {
            Ok(persisted) if persisted.tokenizer_config_hash == tokenizer_config_hash() => persisted.data,
            Ok(_) => {
                tracing::warn!(tenant_id, "bm25 tokenizer config hash mismatch, starting fresh");
                TenantIndexData::default()
            }
            Err(e) => {
                tracing::warn!(tenant_id, error = %e, "corrupt bm25 file, starting fresh");
                TenantIndexData::default()
            }
        }
    }

    fn persist_to_disk(&self, tenant_id: &str, data: &TenantIndexData) -> Result<(), RagError> {
        let persisted = PersistedFile {
            tokenizer_config_hash: tokenizer_config_hash(),
            data: data.clone(),
        };
        let mut bytes = vec![FORMAT_VERSION];
        bytes.extend(serde_json::to_vec(&persisted).map_err(RagError::from)?);

        let final_path = self.file_path(tenant_id);
        let tmp_path = self.dir.join(format!("{tenant_id}.bm25.tmp"));
        std::fs::write(&tmp_path, &bytes).map_err(|e| RagError::IndexWriteFailure {
            document_id: String::new(),
            message: e.to_string(),
        })?;
        std::fs::rename(&tmp_path, &final_path).map_err(|e| RagError::IndexWriteFailure {
            document_id: String::new(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn state_for(&self, tenant_id: &TenantId) -> Arc<TenantState> {
        if let Some(state) = self.tenants.get(tenant_id) {
            return state.clone();
        }
        let data = self.load_from_disk(tenant_id);
        let state = Arc::new(TenantState {
            write_lock: tokio::sync::Mutex::new(()),
            snapshot: RwLock::new(Arc::new(data)),
        });
        self.tenants.entry(tenant_id.clone()).or_insert_with(|| state.clone());
        state
    }

    pub async fn upsert(&self, tenant_id: &TenantId, chunks: &[Chunk]) -> Result<(), RagError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let state = self.state_for(tenant_id);
        let _guard = state.write_lock.lock().await;

        let mut data = (**state.snapshot.read()).clone();
        for chunk in chunks {
            if &chunk.tenant_id != tenant_id {
                return Err(RagError::TenantScopeViolation {
                    message: format!("chunk {} does not belong to tenant {tenant_id}", chunk.chunk_id),
                });
            }
            data.insert_chunk(chunk);
        }

        self.persist_to_disk(tenant_id, &data)?;
        *state.snapshot.write() = Arc::new(data);
        Ok(())
    }

    pub async fn search(&self, tenant_id: &TenantId, query: &str, k: usize) -> Result<Vec<ScoredChunk>, RagError> {
        if tenant_id.is_empty() {
            return Err(RagError::TenantScopeViolation {
                message: "lexical search requires a non-empty tenant_id".to_string(),
            });
        }
        let state = self.state_for(tenant_id);
        let snapshot = state.snapshot.read().clone();
        Ok(snapshot.search(tenant_id, query, k))
    }

    pub async fn delete_by_document(&self, tenant_id: &TenantId, document_id: &DocumentId) -> Result<usize, RagError> {
        let state = self.state_for(tenant_id);
        let _guard = state.write_lock.lock().await;

        let mut data = (**state.snapshot.read()).clone();
        let to_remove: Vec<ChunkId> = data
            .chunks
            .iter()
            .filter(|(_, entry)| &entry.document_id == document_id)
            .map(|(id, _)| id.clone())
            .collect();
        let removed = to_remove.len();
        for chunk_id in &to_remove {
            data.remove_chunk(chunk_id);
        }
        self.persist_to_disk(tenant_id, &data)?;
        *state.snapshot.write() = Arc::new(data);
        Ok(removed)
    }

    pub async fn delete_by_tenant(&self, tenant_id: &TenantId) -> Result<(), RagError> {
        let state = self.state_for(tenant_id);
        let _guard = state.write_lock.lock().await;
        let empty = TenantIndexData::default();
        self.persist_to_disk(tenant_id, &empty)?;
        *state.snapshot.write() = Arc::new(empty);
        Ok(())
    }

    pub async fn count(&self, tenant_id: &TenantId) -> Result<usize, RagError> {
        let state = self.state_for(tenant_id);
        let snapshot = state.snapshot.read().clone();
        Ok(snapshot.chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkMetadata as CM;

    fn chunk(doc: &str, tenant: &str, ordinal: u32, text: &str) -> Chunk {
        Chunk {
            chunk_id: crate::types::derive_chunk_id(doc, ordinal),
            document_id: doc.to_string(),
            tenant_id: tenant.to_string(),
            ordinal,
            text: text.to_string(),
            token_count: text.split_whitespace().count(),
            metadata: CM { source_filename: "f.txt".to_string(), page: None, ordinal },
        }
    }

    #[tokio::test]
    async fn search_is_scoped_to_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let index = LexicalIndex::new(dir.path().to_path_buf());
        index.upsert(&"t1".to_string(), &[chunk("d1", "t1", 0, "alpha secret document")]).await.unwrap();
        index.upsert(&"t2".to_string(), &[chunk("d2", "t2", 0, "alpha secret document")]).await.unwrap();

        let hits = index.search(&"t1".to_string(), "alpha secret", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tenant_id, "t1");

        let empty = index.search(&"t3".to_string(), "alpha secret", 10).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn ties_broken_by_chunk_id_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let index = LexicalIndex::new(dir.path().to_path_buf());
        let tenant = "t1".to_string();
        index
            .upsert(&tenant, &[chunk("docB", "t1", 0, "widget"), chunk("docA", "t1", 0, "widget")])
            .await
            .unwrap();
        let hits = index.search(&tenant, "widget", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].chunk_id < hits[1].chunk_id);
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        {
            let index = LexicalIndex::new(path.clone());
            index.upsert(&"t1".to_string(), &[chunk("d1", "t1", 0, "persisted content")]).await.unwrap();
        }
        let reloaded = LexicalIndex::new(path);
        let hits = reloaded.search(&"t1".to_string(), "persisted", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_by_document_removes_only_its_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let index = LexicalIndex::new(dir.path().to_path_buf());
        let tenant = "t1".to_string();
        index.upsert(&tenant, &[chunk("docA", "t1", 0, "alpha"), chunk("docB", "t1", 0, "beta")]).await.unwrap();
        let removed = index.delete_by_document(&tenant, &"docA".to_string()).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.count(&tenant).await.unwrap(), 1);
    }

    #[test]
    fn tokenize_lowercases_strips_punctuation_and_stopwords() {
        let tokens = tokenize("The Quick, Brown Fox!");
        assert_eq!(tokens, vec!["quick", "brown", "fox"]);
    }
}
