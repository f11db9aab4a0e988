//! Job store (§4.10, §6): tracks ingestion work so a caller can poll
//! status without blocking on the worker.

use crate::types::{Job, JobId, JobKind, JobResult, JobStatus, TenantId};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, tenant_id: &TenantId, kind: JobKind) -> Job;
    async fn get(&self, job_id: &JobId) -> Option<Job>;
    async fn claim_next(&self) -> Option<Job>;
    async fn update_progress(&self, job_id: &JobId, progress: f32);
    async fn complete(&self, job_id: &JobId, result: JobResult);
    async fn fail(&self, job_id: &JobId, error: String);
}

/// In-memory job store. Durable persistence is out of scope for this
/// core (§1 names the job queue as a collaborator at larger scale); this
/// implementation is what an embedded or single-process deployment uses
/// directly.
pub struct InMemoryJobStore {
    jobs: Mutex<Vec<Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self { jobs: Mutex::new(Vec::new()) }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, tenant_id: &TenantId, kind: JobKind) -> Job {
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.clone(),
            kind,
            status: JobStatus::Pending,
            progress: 0.0,
            error: None,
            result: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.jobs.lock().push(job.clone());
        job
    }

    async fn get(&self, job_id: &JobId) -> Option<Job> {
        self.jobs.lock().iter().find(|j| &j.job_id == job_id).cloned()
    }

    async fn claim_next(&self) -> Option<Job> {
        let mut jobs = self.jobs.lock();
        let job = jobs.iter_mut().find(|j| j.status == JobStatus::Pending)?;
        job.status = JobStatus::Processing;
        job.updated_at = Utc::now();
        Some(job.clone())
    }

    async fn update_progress(&self, job_id: &JobId, progress: f32) {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.iter_mut().find(|j| &j.job_id == job_id) {
            job.progress = progress;
            job.updated_at = Utc::now();
        }
    }

    async fn complete(&self, job_id: &JobId, result: JobResult) {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.iter_mut().find(|j| &j.job_id == job_id) {
            job.status = JobStatus::Completed;
            job.progress = 1.0;
            job.result = Some(result);
            job.updated_at = Utc::now();
        }
    }

    async fn fail(&self, job_id: &JobId, error: String) {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.iter_mut().find(|j| &j.job_id == job_id) {
            job.status = JobStatus::Failed;
            job.error = Some(error);
            job.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_claim_transitions_to_processing() {
        let store = InMemoryJobStore::new();
        let job = store
            .enqueue(&"t1".to_string(), JobKind::DocumentUpload { document_id: "d1".into(), tenant_id: "t1".into(), path: "f.txt".into() })
            .await;
        assert_eq!(job.status, JobStatus::Pending);

        let claimed = store.claim_next().await.unwrap();
        assert_eq!(claimed.job_id, job.job_id);
        assert_eq!(claimed.status, JobStatus::Processing);

        assert!(store.claim_next().await.is_none());
    }

    #[tokio::test]
    async fn complete_records_result() {
        let store = InMemoryJobStore::new();
        let job = store
            .enqueue(&"t1".to_string(), JobKind::DocumentUpload { document_id: "d1".into(), tenant_id: "t1".into(), path: "f.txt".into() })
            .await;
        store.complete(&job.job_id, JobResult { chunks_created: 3, embeddings_generated: 3, truncation_warnings: Vec::new() }).await;
        let fetched = store.get(&job.job_id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert_eq!(fetched.progress, 1.0);
        assert_eq!(fetched.result.unwrap().chunks_created, 3);
    }
}
