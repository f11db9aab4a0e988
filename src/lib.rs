//! Retrieval and answer-generation core for a multi-tenant RAG service.
//!
//! See [`orchestrator::Orchestrator`] for the entry point a caller drives
//! per chat turn, and [`ingestion::worker::IngestionWorker`] for the
//! document-upload pipeline.

pub mod config;
pub mod embeddings;
pub mod error;
pub mod generator;
pub mod index;
pub mod ingestion;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod planner;
pub mod processing;
pub mod search;
pub mod tenant;
pub mod types;

pub use config::RagConfig;
pub use error::RagError;
pub use orchestrator::Orchestrator;
pub use tenant::{Tenant, TenantRegistry};

/// Installs a `tracing_subscriber::fmt` layer with an `EnvFilter` sourced
/// from `RUST_LOG` (default `info`), for embedders that don't already run
/// their own subscriber. A standalone service binary wrapping this crate
/// should call this once at startup.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
