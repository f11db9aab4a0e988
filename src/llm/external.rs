//! Generic OpenAI-compatible external chat provider.
//!
//! One HTTP endpoint covers every chat-model call this core needs:
//! connection pooling tuned for a long-lived service (`connect_timeout`/
//! `timeout`/`pool_idle_timeout`/`tcp_nodelay`), HTML-vs-JSON response
//! sniffing in `parse_json_response` so a misconfigured endpoint fails
//! with a readable error instead of a cryptic serde one, and SSE
//! `data: ` line parsing for streaming.

use super::{ChatMessage, ChatProvider, ChatRole, GenerationConfig, TokenStream};
use crate::error::RagError;
use async_trait::async_trait;
use futures_util::stream::StreamExt;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct ExternalChatProvider {
    endpoint: String,
    api_key: String,
    model: String,
    client: Client,
}

impl ExternalChatProvider {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, RagError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(300))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(RagError::from)?;

        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    fn role_str(role: ChatRole) -> &'static str {
        match role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    fn messages_json(messages: &[ChatMessage]) -> serde_json::Value {
        json!(messages
            .iter()
            .map(|m| json!({ "role": Self::role_str(m.role), "content": m.content }))
            .collect::<Vec<_>>())
    }

    /// Parse a response body as JSON, surfacing a clear error (rather
    /// than a cryptic serde one) if the endpoint returned an HTML error
    /// page instead.
    async fn parse_json_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, RagError> {
        let status = response.status();
        let body = response.text().await.map_err(RagError::from)?;
        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(RagError::classify_http(
                "chat-model",
                status.as_u16(),
                format!("endpoint returned HTML instead of JSON: {preview}"),
            ));
        }
        if !status.is_success() {
            return Err(RagError::classify_http("chat-model", status.as_u16(), body));
        }
        serde_json::from_str(&body).map_err(RagError::from)
    }
}

#[async_trait]
impl ChatProvider for ExternalChatProvider {
    async fn generate(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Result<String, RagError> {
        let mut body = json!({
            "model": self.model,
            "messages": Self::messages_json(messages),
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "stream": false,
        });
        if let Some(schema) = &config.json_schema {
            body["response_format"] = json!({ "type": "json_schema", "json_schema": schema });
        }

        let response = tokio::time::timeout(
            config.deadline,
            self.client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| RagError::TransientUpstream {
            collaborator: "chat-model",
            message: "request timed out".to_string(),
        })?
        .map_err(RagError::from)?;

        #[derive(serde::Deserialize)]
        struct Choice {
            message: ChoiceMessage,
        }
        #[derive(serde::Deserialize)]
        struct ChoiceMessage {
            content: String,
        }
        #[derive(serde::Deserialize)]
        struct Response {
            choices: Vec<Choice>,
        }

        let parsed: Response = Self::parse_json_response(response).await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| RagError::PermanentUpstream {
                collaborator: "chat-model",
                message: "response contained no choices".to_string(),
            })
    }

    async fn generate_stream(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Result<TokenStream, RagError> {
        let body = json!({
            "model": self.model,
            "messages": Self::messages_json(messages),
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "stream": true,
        });

        let response = tokio::time::timeout(
            config.deadline,
            self.client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| RagError::TransientUpstream {
            collaborator: "chat-model",
            message: "request timed out".to_string(),
        })?
        .map_err(RagError::from)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::classify_http("chat-model", status, body));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!("chat stream chunk error: {e}");
                        break;
                    }
                };
                let chunk_str = String::from_utf8_lossy(&chunk);
                for line in chunk_str.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }
                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) {
                        if let Some(content) = parsed["choices"][0]["delta"]["content"].as_str() {
                            if tx.send(content.to_string()).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(TokenStream::new(rx))
    }
}
