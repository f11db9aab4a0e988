//! Ingestion pipeline (§4.10): job queue plus the worker that drains it.

pub mod job;
pub mod worker;

pub use job::{InMemoryJobStore, JobStore};
pub use worker::{IngestionWorker, TextExtractor};
