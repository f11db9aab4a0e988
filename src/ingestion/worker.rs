//! Ingestion worker (§4.10): consumes `DocumentUpload` jobs, chunks and
//! embeds the extracted text, and upserts into both indices.

use super::job::JobStore;
use crate::embeddings::Embedder;
use crate::error::RagError;
use crate::index::{LexicalIndex, VectorIndex};
use crate::processing::TextChunker;
use crate::types::{EmbeddedChunk, JobKind, JobResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Text extraction is an external collaborator (§1 scopes parsing PDFs,
/// Office docs, etc. out of this core); this trait is the seam a caller
/// plugs a real extractor into.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &str) -> Result<String, RagError>;
}

pub struct IngestionWorker {
    job_store: Arc<dyn JobStore>,
    extractor: Arc<dyn TextExtractor>,
    chunker: TextChunker,
    embedder: Arc<dyn Embedder>,
    vector_index: Arc<dyn VectorIndex>,
    lexical_index: Arc<LexicalIndex>,
    max_batch: usize,
}

impl IngestionWorker {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        extractor: Arc<dyn TextExtractor>,
        chunker: TextChunker,
        embedder: Arc<dyn Embedder>,
        vector_index: Arc<dyn VectorIndex>,
        lexical_index: Arc<LexicalIndex>,
        max_batch: usize,
    ) -> Self {
        Self {
            job_store,
            extractor,
            chunker,
            embedder,
            vector_index,
            lexical_index,
            max_batch,
        }
    }

    /// Claim and process a single pending job, if one exists. Returns
    /// `false` when the queue was empty so a caller can back off.
    pub async fn process_next(&self) -> bool {
        let Some(job) = self.job_store.claim_next().await else {
            return false;
        };

        let JobKind::DocumentUpload { document_id, tenant_id, path } = &job.kind;

        match self.run(&job.job_id, document_id, tenant_id, path).await {
            Ok(result) => self.job_store.complete(&job.job_id, result).await,
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, error = %e, "ingestion job failed");
                self.job_store.fail(&job.job_id, e.to_string()).await;
            }
        }
        true
    }

    /// Safe under at-least-once redelivery: `chunk_id`s are deterministic
    /// from `(document_id, ordinal)` and both indices' upserts are
    /// idempotent, so a retried job overwrites rather than duplicates.
    /// Progress is reported at the coarse milestones from §4.10: 0.1
    /// after extraction+chunking, 0.5 after embedding, 0.9 after both
    /// index upserts, 1.0 on `complete()`.
    async fn run(&self, job_id: &crate::types::JobId, document_id: &str, tenant_id: &str, path: &str) -> Result<JobResult, RagError> {
        let text = self.extractor.extract(path).await?;

        let document_id = document_id.to_string();
        let tenant_id_owned = tenant_id.to_string();
        let source_filename = path.rsplit('/').next().unwrap_or(path).to_string();
        let chunks = self.chunker.chunk_document(&document_id, &tenant_id_owned, &source_filename, &text);
        if chunks.is_empty() {
            self.job_store.update_progress(job_id, 1.0).await;
            return Ok(JobResult { chunks_created: 0, embeddings_generated: 0, truncation_warnings: Vec::new() });
        }
        self.job_store.update_progress(job_id, 0.1).await;

        let mut embedded_chunks = Vec::with_capacity(chunks.len());
        let mut truncation_warnings = Vec::new();
        for batch in chunks.chunks(self.max_batch) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let (vectors, warnings) = self.embedder.embed(&texts).await.map_err(|e| RagError::EmbedFailure {
                document_id: document_id.to_string(),
                message: e.to_string(),
            })?;
            truncation_warnings.extend(warnings.0);
            for (chunk, vector) in batch.iter().zip(vectors) {
                embedded_chunks.push(EmbeddedChunk { chunk: chunk.clone(), vector });
            }
        }
        self.job_store.update_progress(job_id, 0.5).await;

        self.vector_index
            .upsert(&tenant_id_owned, embedded_chunks.clone())
            .await
            .map_err(|e| RagError::IndexWriteFailure { document_id: document_id.to_string(), message: e.to_string() })?;

        let plain_chunks: Vec<_> = embedded_chunks.iter().map(|ec| ec.chunk.clone()).collect();
        self.lexical_index
            .upsert(&tenant_id_owned, &plain_chunks)
            .await
            .map_err(|e| RagError::IndexWriteFailure { document_id: document_id.to_string(), message: e.to_string() })?;
        self.job_store.update_progress(job_id, 0.9).await;

        Ok(JobResult {
            chunks_created: chunks.len(),
            embeddings_generated: embedded_chunks.len(),
            truncation_warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RagConfig;
    use crate::ingestion::job::InMemoryJobStore;
    use crate::types::ScoredChunk;

    struct StubExtractor;
    #[async_trait]
    impl TextExtractor for StubExtractor {
        async fn extract(&self, _path: &str) -> Result<String, RagError> {
            Ok("The quick brown fox jumps over the lazy dog. ".repeat(20))
        }
    }

    struct StubEmbedder;
    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, crate::embeddings::TruncationWarnings), RagError> {
            Ok((texts.iter().map(|_| vec![0.1_f32; 8]).collect(), crate::embeddings::TruncationWarnings::default()))
        }
        fn dimension(&self) -> usize {
            8
        }
    }

    struct StubVectorIndex {
        upserts: parking_lot::Mutex<usize>,
    }
    #[async_trait]
    impl VectorIndex for StubVectorIndex {
        async fn upsert(&self, _tenant_id: &String, chunks: Vec<EmbeddedChunk>) -> Result<(), RagError> {
            *self.upserts.lock() += chunks.len();
            Ok(())
        }
        async fn search(&self, _tenant_id: &String, _query_vector: &[f32], _k: usize) -> Result<Vec<ScoredChunk>, RagError> {
            Ok(Vec::new())
        }
        async fn delete_by_document(&self, _tenant_id: &String, _document_id: &String) -> Result<usize, RagError> {
            Ok(0)
        }
        async fn delete_by_tenant(&self, _tenant_id: &String) -> Result<usize, RagError> {
            Ok(0)
        }
        async fn count(&self, _tenant_id: &String) -> Result<usize, RagError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn successful_job_reports_chunk_and_embedding_counts() {
        let dir = tempfile::tempdir().unwrap();
        let job_store = Arc::new(InMemoryJobStore::new());
        let job = job_store
            .enqueue(&"t1".to_string(), JobKind::DocumentUpload { document_id: "d1".into(), tenant_id: "t1".into(), path: "f.txt".into() })
            .await;

        let vector_index = Arc::new(StubVectorIndex { upserts: parking_lot::Mutex::new(0) });
        let lexical_index = Arc::new(LexicalIndex::new(dir.path().to_path_buf()));
        let mut config = RagConfig::default();
        config.chunk_size = 32;
        config.chunk_overlap = 4;

        let worker = IngestionWorker::new(
            job_store.clone(),
            Arc::new(StubExtractor),
            TextChunker::new(config.chunk_size, config.chunk_overlap),
            Arc::new(StubEmbedder),
            vector_index.clone(),
            lexical_index,
            config.max_batch,
        );

        let processed = worker.process_next().await;
        assert!(processed);

        let finished = job_store.get(&job.job_id).await.unwrap();
        assert_eq!(finished.status, crate::types::JobStatus::Completed);
        let result = finished.result.unwrap();
        assert!(result.chunks_created > 0);
        assert_eq!(result.chunks_created, result.embeddings_generated);
        assert_eq!(*vector_index.upserts.lock(), result.embeddings_generated);
        assert_eq!(finished.progress, 1.0);
    }

    #[tokio::test]
    async fn empty_document_reports_complete_progress_without_embedding() {
        struct EmptyExtractor;
        #[async_trait]
        impl TextExtractor for EmptyExtractor {
            async fn extract(&self, _path: &str) -> Result<String, RagError> {
                Ok(String::new())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let job_store = Arc::new(InMemoryJobStore::new());
        let job = job_store
            .enqueue(&"t1".to_string(), JobKind::DocumentUpload { document_id: "d1".into(), tenant_id: "t1".into(), path: "f.txt".into() })
            .await;

        let worker = IngestionWorker::new(
            job_store.clone(),
            Arc::new(EmptyExtractor),
            TextChunker::new(512, 50),
            Arc::new(StubEmbedder),
            Arc::new(StubVectorIndex { upserts: parking_lot::Mutex::new(0) }),
            Arc::new(LexicalIndex::new(dir.path().to_path_buf())),
            128,
        );

        assert!(worker.process_next().await);
        let finished = job_store.get(&job.job_id).await.unwrap();
        assert_eq!(finished.progress, 1.0);
        assert_eq!(finished.result.unwrap().chunks_created, 0);
    }

    #[tokio::test]
    async fn empty_queue_reports_no_work() {
        let job_store = Arc::new(InMemoryJobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let worker = IngestionWorker::new(
            job_store,
            Arc::new(StubExtractor),
            TextChunker::new(512, 50),
            Arc::new(StubEmbedder),
            Arc::new(StubVectorIndex { upserts: parking_lot::Mutex::new(0) }),
            Arc::new(LexicalIndex::new(dir.path().to_path_buf())),
            128,
        );
        assert!(!worker.process_next().await);
    }
}
