//! Error taxonomy for the retrieval/generation core.
//!
//! Call sites that need to branch on failure class (retry, Job
//! bookkeeping, fail-closed isolation) match on [`RagError`]; call sites
//! that just need to propagate use `anyhow::Result` as elsewhere in this
//! crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// Upstream call failed in a way that is expected to succeed on retry:
    /// HTTP 5xx, a timeout, or HTTP 429 (rate limit).
    #[error("transient upstream failure calling {collaborator}: {message}")]
    TransientUpstream {
        collaborator: &'static str,
        message: String,
    },

    /// Upstream call failed in a way retrying will not fix: HTTP 4xx
    /// (other than 429) or a schema violation in the response.
    #[error("permanent upstream failure calling {collaborator}: {message}")]
    PermanentUpstream {
        collaborator: &'static str,
        message: String,
    },

    /// The embedding call failed and exhausted its retry budget during
    /// ingestion; the enclosing Job must be failed.
    #[error("embedding failed for document {document_id}: {message}")]
    EmbedFailure {
        document_id: String,
        message: String,
    },

    /// A write to the vector or lexical index failed; the two indices
    /// may now disagree and the Job must be failed so ingestion is retried.
    #[error("index write failed for document {document_id}: {message}")]
    IndexWriteFailure {
        document_id: String,
        message: String,
    },

    /// An operation was attempted without (or with a mismatched) tenant
    /// filter. Always fatal for the call; callers must fail closed.
    #[error("tenant scope violation: {message}")]
    TenantScopeViolation { message: String },

    /// An external collaborator reported a quota/usage limit. Surfaced to
    /// the caller verbatim, not retried locally.
    #[error("quota exceeded: {message}")]
    QuotaExceeded { message: String },

    /// The client disconnected mid-stream. Not a user-visible error; the
    /// orchestrator persists best-effort and moves on.
    #[error("cancelled by client")]
    CancelledByClient,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Classify an HTTP status code the way every upstream collaborator
    /// (chat model, embedding model) in this crate is classified: 429 and
    /// 5xx are transient, everything else in 4xx is permanent.
    pub fn classify_http(collaborator: &'static str, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 429 || (500..600).contains(&status) {
            RagError::TransientUpstream { collaborator, message }
        } else {
            RagError::PermanentUpstream { collaborator, message }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RagError::TransientUpstream { .. })
    }
}

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RagError::TransientUpstream {
                collaborator: "http",
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            RagError::classify_http("http", status.as_u16(), err.to_string())
        } else {
            RagError::TransientUpstream {
                collaborator: "http",
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        RagError::PermanentUpstream {
            collaborator: "json",
            message: err.to_string(),
        }
    }
}
