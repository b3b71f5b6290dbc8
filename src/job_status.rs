//! Job-status service (C18): tracks the lifecycle of an API-initiated
//! trade capture from submission through completion.
//!
//! Backed by coordination-store keys with a retention TTL matching the
//! retention window; there is no durable-store schema for archival in
//! this crate (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::coordination::CoordinationStore;
use crate::error::{CoreError, ErrorDetail};
use crate::model::{JobStatus, JobStatusKind};

pub struct JobStatusService {
    coordination: Arc<dyn CoordinationStore>,
    retention: Duration,
}

impl JobStatusService {
    pub fn new(coordination: Arc<dyn CoordinationStore>, retention: Duration) -> Self {
        Self {
            coordination,
            retention,
        }
    }

    fn cache_key(job_id: &Uuid) -> String {
        format!("job:{job_id}")
    }

    /// Create a job-status record, generating a job id if the caller
    /// didn't supply one.
    pub async fn create(&self, job_id: Option<Uuid>, trade_id: String, source_api: String) -> Result<Uuid, CoreError> {
        let job_id = job_id.unwrap_or_else(Uuid::new_v4);
        let status = JobStatus::new(job_id, trade_id, source_api);
        self.store(&status).await?;
        Ok(job_id)
    }

    pub async fn update(
        &self,
        job_id: Uuid,
        status: JobStatusKind,
        progress: u8,
        message: Option<String>,
        result: Option<serde_json::Value>,
        error: Option<ErrorDetail>,
    ) -> Result<JobStatus, CoreError> {
        let mut current = self
            .get(job_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
        current.status = status;
        current.progress = progress;
        current.message = message;
        current.result = result;
        current.error = error;
        current.updated_at = chrono::Utc::now();
        self.store(&current).await?;
        Ok(current)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<JobStatus>, CoreError> {
        let Some(bytes) = self.coordination.get(&Self::cache_key(&job_id)).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CoreError::Internal(format!("decoding job status: {e}")))
    }

    async fn store(&self, status: &JobStatus) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(status).map_err(|e| CoreError::Internal(format!("encoding job status: {e}")))?;
        self.coordination
            .set(&Self::cache_key(&status.job_id), bytes, Some(self.retention))
            .await
    }
}
