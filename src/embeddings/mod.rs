//! The embedding model collaborator (§4.2).
//!
//! An async, batch-oriented contract backed by a single external HTTP
//! provider, since this core only ever calls an external embedding model
//! rather than running one locally.

use crate::error::RagError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// `embed(batch) -> (vectors, truncation_warnings)`, order-preserving,
/// output length == input length (§4.2). Any oversize item truncated
/// before embedding is reported back via `TruncationWarnings` rather than
/// only logged, so a caller can record it in job metadata.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, TruncationWarnings), RagError>;

    fn dimension(&self) -> usize;
}

/// HTTP embedding provider: batches up to `max_batch` items per request,
/// truncates oversize items with a warning, and retries transient
/// failures with exponential backoff (initial 1s, factor 2, max 30s, up
/// to 5 attempts).
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimension: usize,
    max_batch: usize,
    max_tokens: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TruncationWarnings(pub Vec<String>);

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        max_batch: usize,
        max_tokens: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(15))
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client builds"),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            dimension,
            max_batch,
            max_tokens,
        }
    }

    /// Rough word-count token approximation, matching the chunker's own
    /// whitespace-based estimate — this core never runs the embedding
    /// model's real tokenizer (out of scope, §1).
    fn approx_tokens(text: &str) -> usize {
        text.split_whitespace().count().max(1)
    }

    fn truncate_oversize(&self, texts: &[String]) -> (Vec<String>, TruncationWarnings) {
        let mut warnings = Vec::new();
        let out = texts
            .iter()
            .map(|t| {
                let approx = Self::approx_tokens(t);
                if approx > self.max_tokens {
                    warnings.push(format!(
                        "item truncated from ~{approx} to ~{} tokens before embedding",
                        self.max_tokens
                    ));
                    t.split_whitespace()
                        .take(self.max_tokens)
                        .collect::<Vec<_>>()
                        .join(" ")
                } else {
                    t.clone()
                }
            })
            .collect();
        (out, TruncationWarnings(warnings))
    }

    async fn embed_batch_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        const MAX_ATTEMPTS: u32 = 5;
        const INITIAL_BACKOFF_SECS: u64 = 1;
        const MAX_BACKOFF_SECS: u64 = 30;

        let mut attempt = 0u32;
        loop {
            match self.embed_batch_once(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    let backoff = Duration::from_secs(
                        (INITIAL_BACKOFF_SECS * 2u64.pow(attempt)).min(MAX_BACKOFF_SECS),
                    );
                    warn!(attempt, ?backoff, "embedding call failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn embed_batch_once(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        #[derive(serde::Serialize)]
        struct Request<'a> {
            model: &'a str,
            input: &'a [String],
        }
        #[derive(serde::Deserialize)]
        struct ResponseItem {
            embedding: Vec<f32>,
        }
        #[derive(serde::Deserialize)]
        struct Response {
            data: Vec<ResponseItem>,
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&Request {
                model: &self.model,
                input: batch,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::classify_http("embedding-model", status, body));
        }

        let parsed: Response = response.json().await?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, TruncationWarnings), RagError> {
        if texts.is_empty() {
            return Ok((Vec::new(), TruncationWarnings::default()));
        }

        let (texts, warnings) = self.truncate_oversize(texts);
        for warning in &warnings.0 {
            warn!("{warning}");
        }

        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.max_batch) {
            let vectors = self.embed_batch_with_retry(chunk).await?;
            out.extend(vectors);
        }
        Ok((out, warnings))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_oversize_items_with_warning() {
        let embedder = HttpEmbedder::new("http://example.invalid", "key", "model", 8, 128, 3);
        let texts = vec!["one two three four five".to_string()];
        let (out, warnings) = embedder.truncate_oversize(&texts);
        assert_eq!(out[0], "one two three");
        assert_eq!(warnings.0.len(), 1);
    }

    #[test]
    fn no_warning_when_within_limit() {
        let embedder = HttpEmbedder::new("http://example.invalid", "key", "model", 8, 128, 10);
        let texts = vec!["short text".to_string()];
        let (out, warnings) = embedder.truncate_oversize(&texts);
        assert_eq!(out[0], "short text");
        assert!(warnings.0.is_empty());
    }
}
