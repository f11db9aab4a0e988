//! Tenant-partitioned vector index (§4.3).
//!
//! Arrow schema-building and `RecordBatch` assembly over LanceDB, using a
//! seed-row-then-delete `ensure_table` trick for creating a table with a
//! fixed schema before any real data exists, scored with the
//! `score = (1.0 - cosine_distance).max(0.0)` convention. The one
//! required behavioural change is isolation: every `search` call here
//! embeds `tenant_id = '...'` into the predicate unconditionally — it is
//! not an optional filter the caller can omit (§4.3 "a missing tenant
//! filter... MUST fail-closed").

use crate::error::RagError;
use crate::types::{ChunkId, ChunkMetadata, DocumentId, EmbeddedChunk, ScoredChunk, TenantId};
use anyhow::Context;
use arrow_array::{Array, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array, FixedSizeListArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, tenant_id: &TenantId, chunks: Vec<EmbeddedChunk>) -> Result<(), RagError>;
    async fn search(&self, tenant_id: &TenantId, query_vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, RagError>;
    async fn delete_by_document(&self, tenant_id: &TenantId, document_id: &DocumentId) -> Result<usize, RagError>;
    async fn delete_by_tenant(&self, tenant_id: &TenantId) -> Result<usize, RagError>;
    async fn count(&self, tenant_id: &TenantId) -> Result<usize, RagError>;
}

pub struct LanceVectorIndex {
    db: lancedb::Connection,
    dimension: usize,
    table_name: String,
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

impl LanceVectorIndex {
    pub async fn new(path: &str, dimension: usize) -> anyhow::Result<Self> {
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(path).execute().await.context("failed to connect to LanceDB")?;
        let store = Self {
            db,
            dimension,
            table_name: "chunks".to_string(),
        };
        store.ensure_table().await?;
        Ok(store)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("tenant_id", DataType::Utf8, false),
            Field::new("ordinal", DataType::UInt32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("source_filename", DataType::Utf8, false),
            Field::new("page", DataType::Int64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), self.dimension as i32),
                true,
            ),
            Field::new("created_at", DataType::Int64, false),
        ]))
    }

    async fn ensure_table(&self) -> anyhow::Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&self.table_name) {
            return Ok(());
        }

        let schema = self.schema();
        let seed_vec = vec![0.0f32; self.dimension];
        let values = Float32Array::from(seed_vec);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(Arc::new(vector_field), self.dimension as i32, Arc::new(values) as Arc<dyn Array>, None);

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec!["__seed__"])),
                Arc::new(StringArray::from(vec!["__seed__"])),
                Arc::new(UInt32Array::from(vec![0u32])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(Int64Array::from(vec![-1i64])),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(Int64Array::from(vec![0i64])),
            ],
        )
        .context("failed to build seed record batch")?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.db.create_table(&self.table_name, Box::new(batches)).execute().await?;

        let table = self.db.open_table(&self.table_name).execute().await?;
        table.delete("id = '__seed__'").await.ok();
        Ok(())
    }

    fn chunk_to_batch(&self, chunks: &[EmbeddedChunk]) -> anyhow::Result<RecordBatch> {
        let schema = self.schema();
        let ids: Vec<&str> = chunks.iter().map(|c| c.chunk.chunk_id.as_str()).collect();
        let doc_ids: Vec<&str> = chunks.iter().map(|c| c.chunk.document_id.as_str()).collect();
        let tenant_ids: Vec<&str> = chunks.iter().map(|c| c.chunk.tenant_id.as_str()).collect();
        let ordinals: Vec<u32> = chunks.iter().map(|c| c.chunk.ordinal).collect();
        let texts: Vec<&str> = chunks.iter().map(|c| c.chunk.text.as_str()).collect();
        let sources: Vec<&str> = chunks.iter().map(|c| c.chunk.metadata.source_filename.as_str()).collect();
        let pages: Vec<i64> = chunks.iter().map(|c| c.chunk.metadata.page.map(|p| p as i64).unwrap_or(-1)).collect();
        let created_ats: Vec<i64> = vec![chrono::Utc::now().timestamp(); chunks.len()];

        let flat_vectors: Vec<f32> = chunks.iter().flat_map(|c| c.vector.iter().copied()).collect();
        let values = Float32Array::from(flat_vectors);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(Arc::new(vector_field), self.dimension as i32, Arc::new(values) as Arc<dyn Array>, None);

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(doc_ids)),
                Arc::new(StringArray::from(tenant_ids)),
                Arc::new(UInt32Array::from(ordinals)),
                Arc::new(StringArray::from(texts)),
                Arc::new(StringArray::from(sources)),
                Arc::new(Int64Array::from(pages)),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(Int64Array::from(created_ats)),
            ],
        )
        .context("failed to build chunk record batch")
    }

    async fn delete_by_predicate(&self, predicate: &str) -> anyhow::Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        let before = table.count_rows(None).await.unwrap_or(0);
        table.delete(predicate).await?;
        let after = table.count_rows(None).await.unwrap_or(0);
        Ok(before.saturating_sub(after))
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    async fn upsert(&self, tenant_id: &TenantId, chunks: Vec<EmbeddedChunk>) -> Result<(), RagError> {
        if chunks.is_empty() {
            return Ok(());
        }
        for c in &chunks {
            if &c.chunk.tenant_id != tenant_id {
                return Err(RagError::TenantScopeViolation {
                    message: format!("chunk {} does not belong to tenant {tenant_id}", c.chunk.chunk_id),
                });
            }
        }

        // Idempotent on chunk_id: delete any existing rows for these ids
        // before inserting the fresh version (same "delete then reinsert"
        // idempotent-reindex pattern as `RAGEngine::add_document`).
        let id_list = chunks
            .iter()
            .map(|c| format!("'{}'", escape(&c.chunk.chunk_id)))
            .collect::<Vec<_>>()
            .join(", ");
        let predicate = format!("id IN ({id_list})");
        self.delete_by_predicate(&predicate).await.map_err(|e| RagError::IndexWriteFailure {
            document_id: chunks[0].chunk.document_id.clone(),
            message: e.to_string(),
        })?;

        let table = self
            .db
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::IndexWriteFailure { document_id: chunks[0].chunk.document_id.clone(), message: e.to_string() })?;

        let schema = self.schema();
        let batch = self
            .chunk_to_batch(&chunks)
            .map_err(|e| RagError::IndexWriteFailure { document_id: chunks[0].chunk.document_id.clone(), message: e.to_string() })?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| RagError::IndexWriteFailure { document_id: chunks[0].chunk.document_id.clone(), message: e.to_string() })?;

        tracing::debug!(tenant_id = %tenant_id, count = chunks.len(), "upserted chunks into vector index");
        Ok(())
    }

    async fn search(&self, tenant_id: &TenantId, query_vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, RagError> {
        if tenant_id.is_empty() {
            return Err(RagError::TenantScopeViolation {
                message: "vector search requires a non-empty tenant_id".to_string(),
            });
        }

        let table = self
            .db
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::Other(e.into()))?;

        let predicate = format!("tenant_id = '{}'", escape(tenant_id));
        let results = table
            .query()
            .nearest_to(query_vector)
            .map_err(|e| RagError::Other(e.into()))?
            .distance_type(lancedb::DistanceType::Cosine)
            .only_if(predicate)
            .limit(k)
            .execute()
            .await
            .map_err(|e| RagError::Other(e.into()))?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await.map_err(|e| RagError::Other(e.into()))?;
        Ok(extract_scored_chunks(&batches, tenant_id))
    }

    async fn delete_by_document(&self, tenant_id: &TenantId, document_id: &DocumentId) -> Result<usize, RagError> {
        let predicate = format!("tenant_id = '{}' AND document_id = '{}'", escape(tenant_id), escape(document_id));
        self.delete_by_predicate(&predicate)
            .await
            .map_err(|e| RagError::IndexWriteFailure { document_id: document_id.clone(), message: e.to_string() })
    }

    async fn delete_by_tenant(&self, tenant_id: &TenantId) -> Result<usize, RagError> {
        let predicate = format!("tenant_id = '{}'", escape(tenant_id));
        self.delete_by_predicate(&predicate)
            .await
            .map_err(|e| RagError::IndexWriteFailure { document_id: String::new(), message: e.to_string() })
    }

    async fn count(&self, tenant_id: &TenantId) -> Result<usize, RagError> {
        let table = self.db.open_table(&self.table_name).execute().await.map_err(|e| RagError::Other(e.into()))?;
        let predicate = format!("tenant_id = '{}'", escape(tenant_id));
        table
            .count_rows(Some(predicate))
            .await
            .map_err(|e| RagError::Other(e.into()))
    }
}

fn extract_scored_chunks(batches: &[RecordBatch], expected_tenant: &str) -> Vec<ScoredChunk> {
    let mut hits = Vec::new();
    for batch in batches {
        let ids = batch.column_by_name("id").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let doc_ids = batch.column_by_name("document_id").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let tenant_ids = batch.column_by_name("tenant_id").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let texts = batch.column_by_name("text").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let sources = batch.column_by_name("source_filename").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let pages = batch.column_by_name("page").and_then(|c| c.as_any().downcast_ref::<Int64Array>());
        let ordinals = batch.column_by_name("ordinal").and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let distances = batch.column_by_name("_distance").and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(ids), Some(doc_ids), Some(tenant_ids), Some(texts)) = (ids, doc_ids, tenant_ids, texts) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            // Defense in depth: the predicate already restricts the
            // query, but a row that somehow doesn't match is dropped
            // rather than ever surfaced (fail-closed, §4.3).
            if tenant_ids.value(i) != expected_tenant {
                continue;
            }
            let score = distances.map(|d| (1.0 - d.value(i)).max(0.0)).unwrap_or(0.0);
            hits.push(ScoredChunk {
                chunk_id: ids.value(i).to_string(),
                document_id: doc_ids.value(i).to_string(),
                tenant_id: tenant_ids.value(i).to_string(),
                text: texts.value(i).to_string(),
                metadata: ChunkMetadata {
                    source_filename: sources.map(|s| s.value(i).to_string()).unwrap_or_default(),
                    page: pages.and_then(|p| {
                        let v = p.value(i);
                        if v < 0 { None } else { Some(v as u32) }
                    }),
                    ordinal: ordinals.map(|o| o.value(i)).unwrap_or(0),
                },
                score,
            });
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, ChunkMetadata as CM};

    fn make_chunk(tenant: &str, doc: &str, ordinal: u32, text: &str) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: Chunk {
                chunk_id: crate::types::derive_chunk_id(doc, ordinal),
                document_id: doc.to_string(),
                tenant_id: tenant.to_string(),
                ordinal,
                text: text.to_string(),
                token_count: text.split_whitespace().count(),
                metadata: CM { source_filename: "f.txt".to_string(), page: None, ordinal },
            },
            vector: vec![1.0, 0.0, 0.0, 0.0],
        }
    }

    #[tokio::test]
    async fn upsert_then_search_ranks_exact_match_first() {
        let dir = tempfile::tempdir().unwrap();
        let index = LanceVectorIndex::new(dir.path().to_str().unwrap(), 4).await.unwrap();
        let tenant = "t1".to_string();
        index.upsert(&tenant, vec![make_chunk("t1", "doc-a", 0, "alpha secret")]).await.unwrap();
        index.upsert(&tenant, vec![make_chunk("t1", "doc-a", 1, "unrelated filler")]).await.unwrap();

        let results = index.search(&tenant, &[1.0, 0.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(results[0].chunk_id, crate::types::derive_chunk_id("doc-a", 0));
    }

    #[tokio::test]
    async fn search_is_scoped_to_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let index = LanceVectorIndex::new(dir.path().to_str().unwrap(), 4).await.unwrap();
        index.upsert(&"t1".to_string(), vec![make_chunk("t1", "doc-a", 0, "alpha secret")]).await.unwrap();
        index.upsert(&"t2".to_string(), vec![make_chunk("t2", "doc-b", 0, "alpha secret")]).await.unwrap();

        let results = index.search(&"t1".to_string(), &[1.0, 0.0, 0.0, 0.0], 10).await.unwrap();
        assert!(results.iter().all(|r| r.tenant_id == "t1"));

        let empty_tenant_results = index.search(&"t3".to_string(), &[1.0, 0.0, 0.0, 0.0], 10).await.unwrap();
        assert!(empty_tenant_results.is_empty());
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_chunk_id() {
        let dir = tempfile::tempdir().unwrap();
        let index = LanceVectorIndex::new(dir.path().to_str().unwrap(), 4).await.unwrap();
        let tenant = "t1".to_string();
        index.upsert(&tenant, vec![make_chunk("t1", "doc-a", 0, "alpha secret")]).await.unwrap();
        index.upsert(&tenant, vec![make_chunk("t1", "doc-a", 0, "alpha secret")]).await.unwrap();
        assert_eq!(index.count(&tenant).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_by_document_removes_only_its_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let index = LanceVectorIndex::new(dir.path().to_str().unwrap(), 4).await.unwrap();
        let tenant = "t1".to_string();
        index.upsert(&tenant, vec![make_chunk("t1", "doc-a", 0, "alpha")]).await.unwrap();
        index.upsert(&tenant, vec![make_chunk("t1", "doc-b", 0, "beta")]).await.unwrap();

        let deleted = index.delete_by_document(&tenant, &"doc-a".to_string()).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(index.count(&tenant).await.unwrap(), 1);
    }
}
