//! LLM batched re-rank (§4.5 step 4): one chat-model call scores every
//! RRF candidate on [0, 10]; parse failure or timeout falls back to the
//! RRF ordering unchanged.

use crate::llm::{ChatMessage, ChatProvider, GenerationConfig};
use crate::types::ScoredChunk;
use std::collections::HashSet;
use std::time::Duration;

const RERANK_TIMEOUT: Duration = Duration::from_secs(15);
const SNIPPET_CHARS: usize = 400;

#[derive(Debug, serde::Deserialize)]
struct RerankEntry {
    index: usize,
    score: f32,
}

/// Score each candidate's relevance to `query` and reorder descending,
/// ties keeping RRF order (stable sort). Falls through to the input
/// order unchanged on any failure — re-ranking is an optimization, not
/// a requirement.
pub async fn llm_rerank(
    provider: &dyn ChatProvider,
    query: &str,
    candidates: Vec<ScoredChunk>,
) -> Vec<ScoredChunk> {
    if candidates.len() <= 1 {
        return candidates;
    }

    let snippets = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let truncated: String = c.text.chars().take(SNIPPET_CHARS).collect();
            format!("[{i}] {truncated}")
        })
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Score the relevance of each numbered passage to the query on a scale of 0 to 10.\n\n\
         Query: \"{query}\"\n\n\
         Passages:\n{snippets}\n\n\
         Respond with a JSON array, one entry per passage, each an object with \
         \"index\" (the passage number) and \"score\" (0-10). Include every passage index exactly once."
    );

    let messages = [ChatMessage::user(prompt)];
    let config = GenerationConfig {
        max_tokens: 512,
        temperature: 0.0,
        json_schema: None,
        deadline: RERANK_TIMEOUT,
    };

    let raw = match tokio::time::timeout(RERANK_TIMEOUT, provider.generate(&messages, &config)).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "re-rank call failed, keeping RRF order");
            return candidates;
        }
        Err(_) => {
            tracing::warn!("re-rank call timed out, keeping RRF order");
            return candidates;
        }
    };

    match parse_scores(&raw, candidates.len()) {
        Some(scores) => apply_scores(candidates, &scores),
        None => {
            tracing::warn!(
                output = %raw.chars().take(200).collect::<String>(),
                "could not parse re-rank output, keeping RRF order"
            );
            candidates
        }
    }
}

/// Three-tier parse: direct JSON array, largest bracketed substring, or
/// give up. Unlike a plain ranking permutation, entries here carry both
/// an index and a score, so integer-extraction fallback isn't viable —
/// a malformed score field makes the whole response untrustworthy.
fn parse_scores(output: &str, expected_count: usize) -> Option<Vec<f32>> {
    let trimmed = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let entries = serde_json::from_str::<Vec<RerankEntry>>(trimmed)
        .ok()
        .or_else(|| {
            let start = trimmed.find('[')?;
            let end = trimmed.rfind(']')?;
            if end <= start {
                return None;
            }
            serde_json::from_str::<Vec<RerankEntry>>(&trimmed[start..=end]).ok()
        })?;

    if entries.is_empty() {
        return None;
    }

    let mut scores = vec![None; expected_count];
    let mut seen = HashSet::new();
    for entry in entries {
        if entry.index < expected_count && seen.insert(entry.index) {
            scores[entry.index] = Some(entry.score.clamp(0.0, 10.0));
        }
    }

    if seen.len() < (expected_count + 1) / 2 {
        return None;
    }

    Some(scores.into_iter().map(|s| s.unwrap_or(0.0)).collect())
}

fn apply_scores(mut candidates: Vec<ScoredChunk>, scores: &[f32]) -> Vec<ScoredChunk> {
    for (chunk, score) in candidates.iter_mut().zip(scores) {
        chunk.score = *score;
    }
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scores_direct_json() {
        let out = r#"[{"index":0,"score":9},{"index":1,"score":2}]"#;
        let scores = parse_scores(out, 2).unwrap();
        assert_eq!(scores, vec![9.0, 2.0]);
    }

    #[test]
    fn parse_scores_with_fences_and_prose() {
        let out = "Here you go:\n```json\n[{\"index\":1,\"score\":7},{\"index\":0,\"score\":3}]\n```";
        let scores = parse_scores(out, 2).unwrap();
        assert_eq!(scores, vec![3.0, 7.0]);
    }

    #[test]
    fn parse_scores_rejects_mostly_missing() {
        let out = r#"[{"index":0,"score":9}]"#;
        assert!(parse_scores(out, 5).is_none());
    }

    #[test]
    fn parse_scores_clamps_out_of_range() {
        let out = r#"[{"index":0,"score":99},{"index":1,"score":-4}]"#;
        let scores = parse_scores(out, 2).unwrap();
        assert_eq!(scores, vec![10.0, 0.0]);
    }
}
