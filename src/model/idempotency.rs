use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::PartitionKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub trade_id: String,
    pub partition_key: PartitionKey,
    pub status: IdempotencyStatus,
    pub swap_blotter_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub archive_flag: bool,
}

impl IdempotencyRecord {
    pub fn new_processing(
        idempotency_key: String,
        trade_id: String,
        partition_key: PartitionKey,
        window: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key,
            trade_id,
            partition_key,
            status: IdempotencyStatus::Processing,
            swap_blotter_ref: None,
            created_at: now,
            completed_at: None,
            expires_at: now + window,
            archive_flag: false,
        }
    }

    pub fn is_unexpired_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed && Utc::now() < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}
