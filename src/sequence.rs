//! Sequence validator + out-of-order buffer (C10): per-partition ordered
//! delivery with a time-windowed buffer for early arrivals, and a
//! background sweep that drains stale buffers to the DLQ.
//!
//! The orchestrator would otherwise need to own both this module and the
//! DLQ publisher, creating a cycle; instead the buffer's timeout sweep
//! takes a [`MessageDrainSink`] trait object supplied by its caller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::config::SequenceConfig;
use crate::durable::DurableStore;
use crate::error::CoreError;
use crate::model::{PartitionKey, PartitionState, PositionState, TradeCaptureMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    GapTooLarge,
    Timeout,
}

#[async_trait]
pub trait MessageDrainSink: Send + Sync {
    async fn drain(
        &self,
        partition_key: &PartitionKey,
        sequence: u64,
        message: TradeCaptureMessage,
        reason: DrainReason,
    ) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceDecision {
    /// In order: process now, `sequence` becomes the partition's new
    /// `lastProcessedSequence`.
    InOrder,
    /// Buffered; the caller must not process yet.
    Buffered,
    /// Out of order but the booking timestamp is too old to wait for
    /// predecessors: process now without advancing past `sequence`.
    ProcessOutOfOrder,
}

pub struct SequenceValidator {
    durable: Arc<dyn DurableStore>,
    config: SequenceConfig,
}

impl SequenceValidator {
    pub fn new(durable: Arc<dyn DurableStore>, config: SequenceConfig) -> Self {
        Self { durable, config }
    }

    /// Classify `sequence` against the partition's last-processed mark
    ///. Returns `Err` with `SequenceOutOfOrderTooOld` /
    /// `SequenceGapTooLarge` for the two DLQ-bound cases.
    pub async fn classify(
        &self,
        partition_key: &PartitionKey,
        sequence: u64,
        booking_timestamp: DateTime<Utc>,
    ) -> Result<SequenceDecision, CoreError> {
        if !self.config.buffer_enabled {
            return Ok(SequenceDecision::InOrder);
        }

        let last_processed = self
            .durable
            .find_partition_state(partition_key, false)
            .await?
            .map(|s| s.last_processed_sequence)
            .unwrap_or(0);

        if sequence == last_processed + 1 {
            return Ok(SequenceDecision::InOrder);
        }
        if sequence <= last_processed {
            return Err(CoreError::SequenceOutOfOrderTooOld {
                partition: partition_key.clone(),
                sequence,
                last_processed,
            });
        }
        if sequence > last_processed + self.config.buffer_window_size {
            return Err(CoreError::SequenceGapTooLarge {
                partition: partition_key.clone(),
                sequence,
                last_processed,
            });
        }

        let lookback = ChronoDuration::days(self.config.time_window_days);
        if Utc::now() - booking_timestamp <= lookback {
            Ok(SequenceDecision::Buffered)
        } else {
            Ok(SequenceDecision::ProcessOutOfOrder)
        }
    }

    /// Persist that `sequence` has now been processed in order.
    pub async fn advance(
        &self,
        partition_key: &PartitionKey,
        sequence: u64,
        position_state: PositionState,
        expected_version: u64,
    ) -> Result<PartitionState, CoreError> {
        self.durable
            .upsert_partition_state(partition_key, position_state, sequence, expected_version)
            .await
    }
}

struct BufferedEntry {
    message: TradeCaptureMessage,
    buffered_at: DateTime<Utc>,
}

/// Per-partition holding area for messages that arrived ahead of their
/// predecessors. Capacity per partition is bounded by `bufferWindow` by
/// construction: [`SequenceValidator::classify`] never returns `Buffered`
/// for a sequence further out than that.
pub struct OutOfOrderBuffer {
    buffers: DashMap<PartitionKey, Mutex<BTreeMap<u64, BufferedEntry>>>,
}

impl OutOfOrderBuffer {
    pub fn new() -> Self {
        Self {
            buffers: DashMap::new(),
        }
    }

    pub async fn insert(&self, partition_key: &PartitionKey, sequence: u64, message: TradeCaptureMessage) {
        let entry = self
            .buffers
            .entry(partition_key.clone())
            .or_insert_with(|| Mutex::new(BTreeMap::new()));
        let mut guard = entry.lock().await;
        guard.insert(
            sequence,
            BufferedEntry {
                message,
                buffered_at: Utc::now(),
            },
        );
    }

    /// Pull out every contiguous buffered message starting at
    /// `last_processed + 1`, in sequence order, stopping at the first gap.
    pub async fn drain_contiguous(
        &self,
        partition_key: &PartitionKey,
        last_processed: u64,
    ) -> Vec<(u64, TradeCaptureMessage)> {
        let Some(entry) = self.buffers.get(partition_key) else {
            return Vec::new();
        };
        let mut guard = entry.lock().await;
        let mut drained = Vec::new();
        let mut next = last_processed + 1;
        while let Some(buffered) = guard.remove(&next) {
            drained.push((next, buffered.message));
            next += 1;
        }
        drained
    }

    /// Drain every partition whose oldest buffered entry has aged past
    /// `buffer_timeout` to `sink` with a `Timeout` reason, clearing it.
    /// Intended to run on a ~30s tick from a background task.
    pub async fn sweep_timeouts(
        &self,
        buffer_timeout: StdDuration,
        sink: &dyn MessageDrainSink,
    ) -> Result<usize, CoreError> {
        let now = Utc::now();
        let mut drained_count = 0;
        for entry in self.buffers.iter() {
            let partition_key = entry.key().clone();
            let stale = {
                let mut guard = entry.value().lock().await;
                let is_stale = guard
                    .values()
                    .next()
                    .is_some_and(|oldest| (now - oldest.buffered_at).to_std().unwrap_or_default() > buffer_timeout);
                if !is_stale {
                    continue;
                }
                std::mem::take(&mut *guard)
            };
            for (sequence, buffered) in stale {
                sink.drain(&partition_key, sequence, buffered.message, DrainReason::Timeout)
                    .await?;
                drained_count += 1;
            }
        }
        Ok(drained_count)
    }
}

impl Default for OutOfOrderBuffer {
    fn default() -> Self {
        Self::new()
    }
}
