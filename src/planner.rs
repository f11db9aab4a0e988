//! Planner (§4.7): classifies a turn and, for knowledge questions,
//! rewrites it to resolve anaphora against memory before retrieval runs.

use crate::error::RagError;
use crate::llm::{ChatMessage, ChatProvider, GenerationConfig};
use crate::types::{Message, MemorySummary};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    Greeting,
    Chitchat,
    Knowledge(String),
    Fallback,
}

#[derive(Debug, serde::Deserialize)]
struct ClassifyResponse {
    decision: String,
    rewritten_query: Option<String>,
}

pub struct Planner {
    chat_provider: std::sync::Arc<dyn ChatProvider>,
}

impl Planner {
    pub fn new(chat_provider: std::sync::Arc<dyn ChatProvider>) -> Self {
        Self { chat_provider }
    }

    /// Single chat-model call with JSON-structured output. On parse
    /// failure: default to `Knowledge(original_query)` (§4.7) — refusing
    /// to answer is worse than attempting unscoped retrieval.
    pub async fn classify_and_rewrite(
        &self,
        query: &str,
        summary: Option<&MemorySummary>,
        recent: &[Message],
    ) -> PlanDecision {
        let history = recent
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let summary_text = summary.map(|s| s.summary_text.as_str()).unwrap_or("(none)");

        let prompt = format!(
            "Classify the user's latest message into exactly one of: \
             greeting, chitchat, knowledge, fallback.\n\
             - greeting: a trivial social opener (hi, hello, thanks).\n\
             - chitchat: general conversation not requiring lookup of facts.\n\
             - knowledge: a question that needs information from a document corpus.\n\
             - fallback: ambiguous or unclear intent.\n\n\
             If the classification is \"knowledge\", also produce a rewritten, \
             self-contained version of the message that resolves any pronouns \
             or references using the conversation history (e.g. \"and the second \
             one?\" -> \"tell me about the second item mentioned\").\n\n\
             Conversation summary: {summary_text}\n\
             Recent turns:\n{history}\n\n\
             Latest message: \"{query}\"\n\n\
             Respond with a JSON object: {{\"decision\": \"...\", \"rewritten_query\": \"...\" or null}}."
        );

        let messages = [ChatMessage::user(prompt)];
        let config = GenerationConfig {
            max_tokens: 256,
            temperature: 0.0,
            json_schema: None,
            deadline: Duration::from_secs(15),
        };

        let raw = match self.chat_provider.generate(&messages, &config).await {
            Ok(text) => text,
            Err(_) => return PlanDecision::Knowledge(query.to_string()),
        };

        Self::parse(&raw, query)
    }

    fn parse(raw: &str, original_query: &str) -> PlanDecision {
        let trimmed = raw
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        let parsed: Result<ClassifyResponse, _> = serde_json::from_str(trimmed).or_else(|_| {
            let start = trimmed.find('{').ok_or(RagError::Other(anyhow::anyhow!("no json object")))?;
            let end = trimmed.rfind('}').ok_or(RagError::Other(anyhow::anyhow!("no json object")))?;
            serde_json::from_str(&trimmed[start..=end]).map_err(RagError::from)
        });

        match parsed {
            Ok(response) => match response.decision.to_lowercase().as_str() {
                "greeting" => PlanDecision::Greeting,
                "chitchat" => PlanDecision::Chitchat,
                "knowledge" => PlanDecision::Knowledge(
                    response.rewritten_query.filter(|q| !q.trim().is_empty()).unwrap_or_else(|| original_query.to_string()),
                ),
                // "fallback" and any decision string outside the known set are
                // both "ambiguous or unclear intent" per §4.7.
                _ => PlanDecision::Fallback,
            },
            Err(_) => PlanDecision::Knowledge(original_query.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_greeting() {
        let decision = Planner::parse(r#"{"decision":"greeting","rewritten_query":null}"#, "hi");
        assert_eq!(decision, PlanDecision::Greeting);
    }

    #[test]
    fn parses_knowledge_with_rewrite() {
        let decision = Planner::parse(
            r#"{"decision":"knowledge","rewritten_query":"what is the refund policy for product X"}"#,
            "what about that one",
        );
        assert_eq!(decision, PlanDecision::Knowledge("what is the refund policy for product X".to_string()));
    }

    #[test]
    fn falls_back_to_knowledge_on_garbage() {
        let decision = Planner::parse("not json at all", "original query");
        assert_eq!(decision, PlanDecision::Knowledge("original query".to_string()));
    }

    #[test]
    fn knowledge_without_rewrite_uses_original() {
        let decision = Planner::parse(r#"{"decision":"knowledge","rewritten_query":null}"#, "original query");
        assert_eq!(decision, PlanDecision::Knowledge("original query".to_string()));
    }

    #[test]
    fn parses_json_wrapped_in_fences() {
        let decision = Planner::parse("```json\n{\"decision\":\"chitchat\",\"rewritten_query\":null}\n```", "hey");
        assert_eq!(decision, PlanDecision::Chitchat);
    }

    #[test]
    fn parses_fallback() {
        let decision = Planner::parse(r#"{"decision":"fallback","rewritten_query":null}"#, "uh what");
        assert_eq!(decision, PlanDecision::Fallback);
    }

    #[test]
    fn unrecognized_decision_string_is_fallback() {
        let decision = Planner::parse(r#"{"decision":"unsure","rewritten_query":null}"#, "uh what");
        assert_eq!(decision, PlanDecision::Fallback);
    }
}
