//! Runtime configuration: the ten knobs in spec §6 plus per-tenant
//! persona. Layered configuration — hard-coded defaults, optionally
//! overridden by a JSON file, with an environment-variable layer added
//! on top, since this core runs unattended rather than inside a desktop
//! app a user configures by hand.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub data_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub retrieval_top_k: usize,
    pub rerank_top_k: usize,
    pub final_top_k: usize,
    pub max_retries: u32,
    pub enable_query_expansion: bool,
    pub memory_window: usize,
    pub max_batch: usize,
    pub max_embed_tokens: usize,
    pub turn_deadline_secs: u64,
    pub cancellation_grace_secs: u64,
    pub embedding_model: String,
    pub chat_model: String,
}

impl RagConfig {
    /// Reject configurations that cannot satisfy the invariants in §3/§4.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size < 32 {
            return Err("chunk_size must be >= 32".into());
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err("chunk_overlap must be < chunk_size".into());
        }
        if self.retrieval_top_k == 0 {
            return Err("retrieval_top_k must be > 0".into());
        }
        if self.rerank_top_k == 0 || self.rerank_top_k > self.retrieval_top_k * 2 {
            return Err("rerank_top_k must be > 0 and reasonable relative to retrieval_top_k".into());
        }
        if self.final_top_k == 0 || self.final_top_k > self.rerank_top_k {
            return Err("final_top_k must be > 0 and <= rerank_top_k".into());
        }
        if self.max_batch == 0 {
            return Err("max_batch must be > 0".into());
        }
        Ok(())
    }

    /// Load from a JSON file. Falling back to `Default` for anything the
    /// file omits is NOT supported by plain `serde_json` field-by-field
    /// merging, so a config file here is expected to be a complete
    /// document; partial overrides belong in `from_env`.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file: {e}"))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("failed to parse config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `RAGCORE_*` environment variables onto `self`, returning
    /// the result. Unset variables leave the corresponding field
    /// untouched; malformed values are reported rather than silently
    /// ignored.
    pub fn from_env(mut self) -> Result<Self, String> {
        macro_rules! overlay_parsed {
            ($env:literal, $field:ident) => {
                if let Ok(raw) = std::env::var($env) {
                    self.$field = raw
                        .parse()
                        .map_err(|_| format!(concat!($env, " must be parseable as the expected type")))?;
                }
            };
        }

        overlay_parsed!("RAGCORE_CHUNK_SIZE", chunk_size);
        overlay_parsed!("RAGCORE_CHUNK_OVERLAP", chunk_overlap);
        overlay_parsed!("RAGCORE_RETRIEVAL_TOP_K", retrieval_top_k);
        overlay_parsed!("RAGCORE_RERANK_TOP_K", rerank_top_k);
        overlay_parsed!("RAGCORE_FINAL_TOP_K", final_top_k);
        overlay_parsed!("RAGCORE_MAX_RETRIES", max_retries);
        overlay_parsed!("RAGCORE_ENABLE_QUERY_EXPANSION", enable_query_expansion);
        overlay_parsed!("RAGCORE_MEMORY_WINDOW", memory_window);

        if let Ok(model) = std::env::var("RAGCORE_EMBEDDING_MODEL") {
            self.embedding_model = model;
        }
        if let Ok(model) = std::env::var("RAGCORE_CHAT_MODEL") {
            self.chat_model = model;
        }

        self.validate()?;
        Ok(self)
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ragcore");

        Self {
            data_dir,
            chunk_size: 512,
            chunk_overlap: 50,
            retrieval_top_k: 20,
            rerank_top_k: 10,
            final_top_k: 5,
            max_retries: 1,
            enable_query_expansion: true,
            memory_window: 10,
            max_batch: 128,
            max_embed_tokens: 8192,
            turn_deadline_secs: 60,
            cancellation_grace_secs: 5,
            embedding_model: "text-embedding-3-small".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Tenant-facing brand persona, consumed read-only by the Generator's
/// system preamble (§4.8, §9 "tagged variant, not dynamic lookup").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPersona {
    pub industry: String,
    pub brand_tone: String,
    pub languages: Vec<String>,
    pub capabilities: Vec<String>,
    pub constraints: Vec<String>,
    pub base_urls: Vec<String>,
}

impl Default for TenantPersona {
    fn default() -> Self {
        Self {
            industry: "general".to_string(),
            brand_tone: "neutral and helpful".to_string(),
            languages: vec!["en".to_string()],
            capabilities: Vec::new(),
            constraints: Vec::new(),
            base_urls: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RagConfig::default();
        assert_eq!(cfg.chunk_size, 512);
        assert_eq!(cfg.chunk_overlap, 50);
        assert_eq!(cfg.retrieval_top_k, 20);
        assert_eq!(cfg.rerank_top_k, 10);
        assert_eq!(cfg.final_top_k, 5);
        assert_eq!(cfg.max_retries, 1);
        assert!(cfg.enable_query_expansion);
        assert_eq!(cfg.memory_window, 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_overlap_ge_chunk_size() {
        let mut cfg = RagConfig::default();
        cfg.chunk_overlap = cfg.chunk_size;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overlay_applies_and_validates() {
        std::env::set_var("RAGCORE_CHUNK_SIZE", "256");
        let cfg = RagConfig::default().from_env().unwrap();
        assert_eq!(cfg.chunk_size, 256);
        std::env::remove_var("RAGCORE_CHUNK_SIZE");
    }
}
