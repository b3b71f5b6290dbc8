//! In-memory `DurableStore`, used by tests and by `tests/scenarios.rs` in
//! place of a real Postgres instance.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::DurableStore;
use crate::error::CoreError;
use crate::model::{
    IdempotencyRecord, IdempotencyStatus, PartitionKey, PartitionState, PositionState, SwapBlotter,
};

#[derive(Default)]
pub struct MemoryDurableStore {
    idempotency: DashMap<String, IdempotencyRecord>,
    partition_state: DashMap<PartitionKey, PartitionState>,
    swap_blotters: DashMap<String, SwapBlotter>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DurableStore for MemoryDurableStore {
    async fn upsert_idempotency(&self, record: IdempotencyRecord) -> Result<(), CoreError> {
        if self.idempotency.contains_key(&record.idempotency_key) {
            return Err(CoreError::DuplicateTrade(record.idempotency_key));
        }
        self.idempotency
            .insert(record.idempotency_key.clone(), record);
        Ok(())
    }

    async fn find_idempotency(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>, CoreError> {
        Ok(self
            .idempotency
            .get(idempotency_key)
            .map(|r| r.value().clone()))
    }

    async fn mark_idempotency(
        &self,
        idempotency_key: &str,
        status: IdempotencyStatus,
        swap_blotter_ref: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        let mut record = self
            .idempotency
            .get_mut(idempotency_key)
            .ok_or_else(|| CoreError::NotFound(format!("idempotency key {idempotency_key}")))?;
        record.status = status;
        if swap_blotter_ref.is_some() {
            record.swap_blotter_ref = swap_blotter_ref;
        }
        record.completed_at = completed_at;
        Ok(())
    }

    async fn find_partition_state(
        &self,
        partition_key: &PartitionKey,
        _for_update: bool,
    ) -> Result<Option<PartitionState>, CoreError> {
        Ok(self
            .partition_state
            .get(partition_key)
            .map(|r| r.value().clone()))
    }

    async fn upsert_partition_state(
        &self,
        partition_key: &PartitionKey,
        new_state: PositionState,
        last_sequence: u64,
        expected_version: u64,
    ) -> Result<PartitionState, CoreError> {
        let mut entry = self
            .partition_state
            .entry(partition_key.clone())
            .or_insert_with(|| PartitionState::new(partition_key.clone()));

        if entry.version != expected_version {
            return Err(CoreError::VersionConflict(partition_key.to_string()));
        }

        entry.position_state = new_state;
        entry.last_processed_sequence = last_sequence;
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn find_swap_blotter_by_trade_id(
        &self,
        trade_id: &str,
    ) -> Result<Option<SwapBlotter>, CoreError> {
        Ok(self.swap_blotters.get(trade_id).map(|r| r.value().clone()))
    }

    async fn upsert_swap_blotter(&self, blotter: SwapBlotter) -> Result<SwapBlotter, CoreError> {
        if let Some(existing) = self.swap_blotters.get(&blotter.trade_id) {
            if existing.version != blotter.version {
                return Err(CoreError::VersionConflict(blotter.trade_id.clone()));
            }
        }
        let mut stored = blotter.clone();
        stored.version += 1;
        self.swap_blotters
            .insert(stored.trade_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn archive_by_date_range(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut count = 0;
        for mut entry in self.swap_blotters.iter_mut() {
            if entry.archive_flag || entry.processing_metadata.processed_at >= cutoff {
                continue;
            }
            entry.archive_flag = true;
            count += 1;
        }
        Ok(count)
    }

    async fn archive_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut count = 0;
        for mut entry in self.idempotency.iter_mut() {
            if entry.expires_at < now && !entry.archive_flag {
                entry.archive_flag = true;
                count += 1;
            }
        }
        Ok(count)
    }
}
