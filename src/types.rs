//! Core data model: tenants, documents, chunks, sessions, messages, jobs.
//!
//! Every entity below carries (directly or transitively) a `tenant_id`.
//! That is not incidental — see [`crate::tenant`] for the isolation
//! boundary these types exist to enforce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type TenantId = String;
pub type DocumentId = String;
pub type ChunkId = String;
pub type SessionId = String;
pub type MessageId = String;
pub type JobId = String;

/// Deterministic chunk identity from `(document_id, ordinal)` so
/// re-ingestion of the same document produces the same ids (§3, §8
/// idempotence invariant).
pub fn derive_chunk_id(document_id: &str, ordinal: u32) -> ChunkId {
    format!("{document_id}:{ordinal:06}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: DocumentId,
    pub tenant_id: TenantId,
    pub filename: String,
    pub raw_text: String,
    pub size: usize,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn new(tenant_id: impl Into<String>, filename: impl Into<String>, raw_text: String) -> Self {
        let size = raw_text.len();
        Self {
            document_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            filename: filename.into(),
            raw_text,
            size,
            uploaded_at: Utc::now(),
        }
    }
}

/// Citation-relevant provenance carried alongside a chunk's text.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkMetadata {
    pub source_filename: String,
    pub page: Option<u32>,
    pub ordinal: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub tenant_id: TenantId,
    pub ordinal: u32,
    pub text: String,
    pub token_count: usize,
    pub metadata: ChunkMetadata,
}

/// A chunk paired with its embedding vector, the unit the indices
/// actually persist (Chunk and Embedding share a lifetime per §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A scored candidate returned by either branch of the hybrid retriever,
/// or by the fused/re-ranked result list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub tenant_id: TenantId,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalMetadata {
    pub chunk_ids: Vec<ChunkId>,
    pub rewritten_query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub retrieval_metadata: Option<RetrievalMetadata>,
}

impl Message {
    pub fn user(session_id: impl Into<String>, tenant_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            tenant_id: tenant_id.into(),
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
            retrieval_metadata: None,
        }
    }

    pub fn assistant(
        session_id: impl Into<String>,
        tenant_id: impl Into<String>,
        content: impl Into<String>,
        retrieval_metadata: Option<RetrievalMetadata>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            tenant_id: tenant_id.into(),
            role: Role::Assistant,
            content: content.into(),
            created_at: Utc::now(),
            retrieval_metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub message_count: usize,
}

impl ChatSession {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            created_at: Utc::now(),
            status: SessionStatus::Active,
            message_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySummary {
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub summary_text: String,
    pub up_to_message_id: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Extensible tagged union of background-work kinds. Only one variant is
/// defined today — see DESIGN.md for why a web-scraping kind is not
/// invented here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    DocumentUpload {
        document_id: DocumentId,
        tenant_id: TenantId,
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobResult {
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    /// One entry per oversize chunk truncated before embedding (§4.2),
    /// so a caller can audit lossy ingestion after the fact.
    pub truncation_warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: f32,
    pub error: Option<String>,
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(tenant_id: impl Into<String>, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            kind,
            status: JobStatus::Pending,
            progress: 0.0,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Free-form key/value metadata attached to chunks or jobs, e.g. an
/// embedder truncation warning.
pub type MetadataMap = HashMap<String, String>;
