use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::PartitionKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionState {
    pub partition_key: PartitionKey,
    pub position_state: PositionState,
    pub last_processed_sequence: u64,
    /// Typed serialization of any extra position state (opaque to the core).
    pub state_blob: serde_json::Value,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub archive_flag: bool,
}

impl PartitionState {
    pub fn new(partition_key: PartitionKey) -> Self {
        Self {
            partition_key,
            position_state: PositionState::Executed,
            last_processed_sequence: 0,
            state_blob: serde_json::Value::Null,
            version: 0,
            updated_at: Utc::now(),
            archive_flag: false,
        }
    }
}

/// CDM position-state lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Executed,
    Formed,
    Settled,
    Cancelled,
    Closed,
}

impl PositionState {
    /// Whether `self -> next` is a permitted transition.
    pub fn can_transition_to(self, next: PositionState) -> bool {
        use PositionState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Executed, Formed)
                | (Executed, Cancelled)
                | (Executed, Closed)
                | (Formed, Settled)
                | (Formed, Closed)
                | (Settled, Closed)
                | (Cancelled, Closed)
        )
    }
}
