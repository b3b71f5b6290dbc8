use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorDetail;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub trade_id: String,
    pub source_api: String,
    pub status: JobStatusKind,
    pub progress: u8,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub estimated_completion_time: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn new(job_id: Uuid, trade_id: String, source_api: String) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            trade_id,
            source_api,
            status: JobStatusKind::Pending,
            progress: 0,
            message: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            estimated_completion_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatusKind {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}
