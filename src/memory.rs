//! Conversation memory (§4.6): a rolling verbatim window per session,
//! compressed beyond that window via a dedicated chat-model call.
//!
//! Structurally this mirrors a simple conversation store — per-session
//! state guarded by its own lock, persisted to disk as JSON, reloaded
//! with graceful degradation on a corrupt file — but keyed per session
//! (dashmap) rather than held behind one global lock, since §5 requires
//! turns on different sessions to proceed independently.

use crate::config::RagConfig;
use crate::error::RagError;
use crate::llm::{ChatMessage, ChatProvider, GenerationConfig};
use crate::types::{Message, MemorySummary, Role, SessionId, TenantId};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const MAX_SUMMARY_TOKENS: u32 = 500;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct SessionMemory {
    window: Vec<Message>,
    summary: Option<MemorySummary>,
}

pub struct ConversationMemory {
    dir: PathBuf,
    window_size: usize,
    chat_provider: Arc<dyn ChatProvider>,
    sessions: DashMap<SessionId, Arc<Mutex<SessionMemory>>>,
}

impl ConversationMemory {
    pub fn new(config: &RagConfig, chat_provider: Arc<dyn ChatProvider>) -> Self {
        let dir = config.data_dir.join("memory");
        std::fs::create_dir_all(&dir).ok();
        Self {
            dir,
            window_size: config.memory_window,
            chat_provider,
            sessions: DashMap::new(),
        }
    }

    fn file_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    fn load_from_disk(&self, session_id: &str) -> SessionMemory {
        let path = self.file_path(session_id);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return SessionMemory::default();
        };
        match serde_json::from_str(&content) {
            Ok(memory) => memory,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "corrupt session memory file, starting fresh");
                SessionMemory::default()
            }
        }
    }

    fn persist_to_disk(&self, session_id: &str, memory: &SessionMemory) {
        let path = self.file_path(session_id);
        match serde_json::to_string(memory) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!(session_id, error = %e, "failed to persist session memory");
                }
            }
            Err(e) => tracing::warn!(session_id, error = %e, "failed to serialize session memory"),
        }
    }

    fn state_for(&self, session_id: &SessionId) -> Arc<Mutex<SessionMemory>> {
        if let Some(state) = self.sessions.get(session_id) {
            return state.clone();
        }
        let memory = self.load_from_disk(session_id);
        let state = Arc::new(Mutex::new(memory));
        self.sessions.entry(session_id.clone()).or_insert_with(|| state.clone());
        state
    }

    /// `(summary?, recent_messages)` — the recent window in chronological
    /// order.
    pub async fn load(&self, session_id: &SessionId) -> (Option<MemorySummary>, Vec<Message>) {
        let state = self.state_for(session_id);
        let guard = state.lock().await;
        (guard.summary.clone(), guard.window.clone())
    }

    /// Append a message. When the window grows past `window_size`,
    /// compress the overflow into the running summary via a dedicated
    /// chat-model call. On compression failure the overflow messages
    /// stay in the window uncompressed — memory must never lose
    /// messages due to a failed compression (§4.6).
    pub async fn append(&self, session_id: &SessionId, tenant_id: &TenantId, message: Message) -> Result<(), RagError> {
        let state = self.state_for(session_id);
        let mut guard = state.lock().await;
        guard.window.push(message);

        if guard.window.len() > self.window_size {
            let overflow_count = guard.window.len() - self.window_size;
            let overflow: Vec<Message> = guard.window.drain(0..overflow_count).collect();
            let last_id = overflow.last().map(|m| m.message_id.clone()).unwrap_or_default();

            match self.compress(tenant_id, guard.summary.as_ref(), &overflow).await {
                Ok(summary_text) => {
                    guard.summary = Some(MemorySummary {
                        session_id: session_id.clone(),
                        tenant_id: tenant_id.clone(),
                        summary_text,
                        up_to_message_id: last_id,
                    });
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "memory compression failed, keeping messages uncompressed");
                    let mut restored = overflow;
                    restored.extend(guard.window.drain(..));
                    guard.window = restored;
                }
            }
        }

        self.persist_to_disk(session_id, &guard);
        Ok(())
    }

    async fn compress(
        &self,
        _tenant_id: &TenantId,
        existing_summary: Option<&MemorySummary>,
        overflow: &[Message],
    ) -> Result<String, RagError> {
        let transcript = overflow
            .iter()
            .map(|m| format!("{}: {}", role_label(m.role), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prior = existing_summary.map(|s| s.summary_text.as_str()).unwrap_or("");

        let prompt = format!(
            "Update the running conversation summary below with the new turns that follow. \
             Preserve user intents, stated preferences, named entities, and unresolved questions. \
             Drop pleasantries and small talk. Keep the result under 500 tokens.\n\n\
             Existing summary:\n{prior}\n\n\
             New turns:\n{transcript}\n\n\
             Respond with only the updated summary text."
        );

        let messages = [ChatMessage::user(prompt)];
        let config = GenerationConfig {
            max_tokens: MAX_SUMMARY_TOKENS,
            temperature: 0.2,
            json_schema: None,
            deadline: std::time::Duration::from_secs(20),
        };
        self.chat_provider.generate(&messages, &config).await
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ChatProvider for StubProvider {
        async fn generate(&self, _messages: &[ChatMessage], _config: &GenerationConfig) -> Result<String, RagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RagError::Other(anyhow::anyhow!("stub failure")))
            } else {
                Ok("compressed summary".to_string())
            }
        }

        async fn generate_stream(&self, _messages: &[ChatMessage], _config: &GenerationConfig) -> Result<crate::llm::TokenStream, RagError> {
            unimplemented!()
        }
    }

    fn test_config(dir: &std::path::Path) -> RagConfig {
        let mut config = RagConfig::default();
        config.data_dir = dir.to_path_buf();
        config.memory_window = 3;
        config
    }

    #[tokio::test]
    async fn window_stays_under_limit_after_compression() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider { calls: AtomicUsize::new(0), fail: false });
        let memory = ConversationMemory::new(&test_config(dir.path()), provider.clone());
        let session_id = "s1".to_string();
        let tenant_id = "t1".to_string();

        for i in 0..5 {
            let msg = Message::user(&session_id, &tenant_id, format!("message {i}"));
            memory.append(&session_id, &tenant_id, msg).await.unwrap();
        }

        let (summary, window) = memory.load(&session_id).await;
        assert!(summary.is_some());
        assert!(window.len() <= 3);
        assert!(provider.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn failed_compression_keeps_all_messages() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider { calls: AtomicUsize::new(0), fail: true });
        let memory = ConversationMemory::new(&test_config(dir.path()), provider);
        let session_id = "s1".to_string();
        let tenant_id = "t1".to_string();

        for i in 0..5 {
            let msg = Message::user(&session_id, &tenant_id, format!("message {i}"));
            memory.append(&session_id, &tenant_id, msg).await.unwrap();
        }

        let (summary, window) = memory.load(&session_id).await;
        assert!(summary.is_none());
        assert_eq!(window.len(), 5);
    }

    #[tokio::test]
    async fn persists_and_reloads_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider { calls: AtomicUsize::new(0), fail: false });
        let session_id = "s1".to_string();
        let tenant_id = "t1".to_string();
        {
            let memory = ConversationMemory::new(&test_config(dir.path()), provider.clone());
            let msg = Message::user(&session_id, &tenant_id, "hello");
            memory.append(&session_id, &tenant_id, msg).await.unwrap();
        }
        let reloaded = ConversationMemory::new(&test_config(dir.path()), provider);
        let (_, window) = reloaded.load(&session_id).await;
        assert_eq!(window.len(), 1);
    }
}
