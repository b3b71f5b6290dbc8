//! Durable-store client (C2): transactional persistence of idempotency
//! records, partition state, and swap blotters.
//!
//! The real backend is Postgres ([`postgres::PostgresDurableStore`]); an
//! in-memory double ([`memory::MemoryDurableStore`]) implements the same
//! trait for tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::model::{IdempotencyRecord, IdempotencyStatus, PartitionKey, PartitionState, PositionState, SwapBlotter};

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert a new idempotency record. Must fail with
    /// [`CoreError::DuplicateTrade`] on a unique-key violation of
    /// `idempotency_key`.
    async fn upsert_idempotency(&self, record: IdempotencyRecord) -> Result<(), CoreError>;

    async fn find_idempotency(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>, CoreError>;

    async fn mark_idempotency(
        &self,
        idempotency_key: &str,
        status: IdempotencyStatus,
        swap_blotter_ref: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    /// Read partition state, optionally taking a pessimistic read-lock for
    /// the caller's critical section (e.g. `SELECT ... FOR UPDATE`).
    async fn find_partition_state(
        &self,
        partition_key: &PartitionKey,
        for_update: bool,
    ) -> Result<Option<PartitionState>, CoreError>;

    /// Optimistic-concurrency upsert: fails with
    /// [`CoreError::VersionConflict`] if `expected_version` does not match
    /// the stored row.
    async fn upsert_partition_state(
        &self,
        partition_key: &PartitionKey,
        new_state: PositionState,
        last_sequence: u64,
        expected_version: u64,
    ) -> Result<PartitionState, CoreError>;

    async fn find_swap_blotter_by_trade_id(
        &self,
        trade_id: &str,
    ) -> Result<Option<SwapBlotter>, CoreError>;

    async fn upsert_swap_blotter(&self, blotter: SwapBlotter) -> Result<SwapBlotter, CoreError>;

    /// Mark swap blotters booked before `cutoff` as archived. Returns the
    /// number of rows affected.
    async fn archive_by_date_range(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError>;

    /// Mark idempotency records whose `expires_at` has passed as archived.
    /// Returns the number of rows affected.
    async fn archive_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, CoreError>;
}
