//! CDM position-state transition service (C15).
//!
//! Reads consult a hot cache keyed by `partitionKey`, falling back to the
//! durable record. Writes take the durable store's pessimistic read-lock
//! row (`for_update = true`) to serialise concurrent transitions on the
//! same partition, then upsert with an incremented version.

use std::sync::Arc;
use std::time::Duration;

use crate::coordination::CoordinationStore;
use crate::durable::DurableStore;
use crate::error::CoreError;
use crate::model::{PartitionKey, PartitionState, PositionState};

pub struct StateMachineService {
    coordination: Arc<dyn CoordinationStore>,
    durable: Arc<dyn DurableStore>,
    cache_ttl: Duration,
}

impl StateMachineService {
    pub fn new(coordination: Arc<dyn CoordinationStore>, durable: Arc<dyn DurableStore>, cache_ttl: Duration) -> Self {
        Self {
            coordination,
            durable,
            cache_ttl,
        }
    }

    fn cache_key(partition_key: &PartitionKey) -> String {
        format!("state:{partition_key}")
    }

    /// Current position state, preferring the hot cache over the durable
    /// record.
    pub async fn current_state(&self, partition_key: &PartitionKey) -> Result<Option<PartitionState>, CoreError> {
        let cache_key = Self::cache_key(partition_key);
        if let Ok(Some(bytes)) = self.coordination.get(&cache_key).await {
            if let Ok(cached) = serde_json::from_slice::<PartitionState>(&bytes) {
                return Ok(Some(cached));
            }
        }

        let state = self.durable.find_partition_state(partition_key, false).await?;
        if let Some(ref s) = state {
            self.warm_cache(s).await;
        }
        Ok(state)
    }

    /// Transition `partition_key` to `next`, failing with
    /// [`CoreError::InvalidStateTransition`] if the CDM lifecycle forbids
    /// the move from its current state.
    pub async fn transition(&self, partition_key: &PartitionKey, next: PositionState) -> Result<PartitionState, CoreError> {
        let current = self.durable.find_partition_state(partition_key, true).await?;
        let (current_position, last_sequence, expected_version) = match &current {
            Some(s) => (s.position_state, s.last_processed_sequence, s.version),
            None => (PositionState::Executed, 0, 0),
        };

        if !current_position.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: format!("{current_position:?}"),
                to: format!("{next:?}"),
            });
        }

        let updated = self
            .durable
            .upsert_partition_state(partition_key, next, last_sequence, expected_version)
            .await?;
        self.warm_cache(&updated).await;
        Ok(updated)
    }

    async fn warm_cache(&self, state: &PartitionState) {
        if let Ok(bytes) = serde_json::to_vec(state) {
            let _ = self
                .coordination
                .set(&Self::cache_key(&state.partition_key), bytes, Some(self.cache_ttl))
                .await;
        }
    }
}
