use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{PartitionKey, TradeLot};
use super::partition_state::PositionState;

/// The enriched trade persisted at the end of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapBlotter {
    pub trade_id: String,
    pub partition_key: PartitionKey,
    pub trade_lots: Vec<TradeLot>,
    /// Derived contract description (economic terms summary).
    pub contract: String,
    pub state: PositionState,
    pub enrichment_status: EnrichmentStatus,
    pub workflow_status: WorkflowStatus,
    pub processing_metadata: ProcessingMetadata,
    /// Monotone counter used for optimistic concurrency.
    pub version: u64,
    pub archive_flag: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrichmentStatus {
    Complete,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    PendingApproval,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub processed_at: DateTime<Utc>,
    pub rules_applied: Vec<String>,
    pub sources: Vec<String>,
    pub processing_time_ms: u64,
}

impl ProcessingMetadata {
    pub fn new() -> Self {
        Self {
            processed_at: Utc::now(),
            rules_applied: Vec::new(),
            sources: Vec::new(),
            processing_time_ms: 0,
        }
    }
}

impl Default for ProcessingMetadata {
    fn default() -> Self {
        Self::new()
    }
}
