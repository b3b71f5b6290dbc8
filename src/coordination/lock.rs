//! Per-partition distributed lock (C8), built on the coordination store's
//! `set_if_absent` / `extend_ttl` / `delete_if_matches` primitives.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::CoordinationStore;
use crate::error::CoreError;
use crate::model::PartitionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    Timeout,
}

/// An acquired lock's release token. Dropping this without calling
/// [`PartitionLockService::release`] leaves the lock held until its TTL
/// expires — callers must release explicitly.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub partition_key: PartitionKey,
    pub token: String,
}

pub struct PartitionLockService {
    store: Arc<dyn CoordinationStore>,
}

impl PartitionLockService {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    fn key_for(partition_key: &PartitionKey) -> String {
        format!("lock:{partition_key}")
    }

    /// Attempt to acquire the lock for `partition_key`, retrying with
    /// jittered backoff until `max_wait` elapses. A `max_wait` of zero means
    /// a single attempt: if the lock is already held elsewhere, this
    /// returns `AcquisitionTimeout` immediately.
    pub async fn acquire(
        &self,
        partition_key: &PartitionKey,
        hold_duration: Duration,
        max_wait: Duration,
    ) -> Result<(AcquireOutcome, Option<LockHandle>), CoreError> {
        let key = Self::key_for(partition_key);
        let token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut attempt = 0u32;

        loop {
            if self
                .store
                .set_if_absent(&key, token.clone().into_bytes(), hold_duration)
                .await?
            {
                return Ok((
                    AcquireOutcome::Acquired,
                    Some(LockHandle {
                        partition_key: partition_key.clone(),
                        token,
                    }),
                ));
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok((AcquireOutcome::Timeout, None));
            }

            attempt += 1;
            let backoff = backoff_with_jitter(attempt);
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(backoff.min(remaining)).await;

            if tokio::time::Instant::now() >= deadline {
                return Ok((AcquireOutcome::Timeout, None));
            }
        }
    }

    /// Release a held lock. Returns `false` if the lock was already gone or
    /// held by a different token (e.g. it expired and was re-acquired).
    pub async fn release(&self, handle: &LockHandle) -> Result<bool, CoreError> {
        let key = Self::key_for(&handle.partition_key);
        self.store
            .delete_if_matches(&key, handle.token.as_bytes())
            .await
    }

    /// Extend a held lock's TTL without releasing it.
    pub async fn extend(
        &self,
        handle: &LockHandle,
        hold_duration: Duration,
    ) -> Result<bool, CoreError> {
        let key = Self::key_for(&handle.partition_key);
        self.store
            .extend_ttl(&key, handle.token.as_bytes(), hold_duration)
            .await
    }

    pub async fn is_locked(&self, partition_key: &PartitionKey) -> Result<bool, CoreError> {
        let key = Self::key_for(partition_key);
        Ok(self.store.get(&key).await?.is_some())
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 20u64.saturating_mul(1u64 << attempt.min(6));
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2 + 1);
    Duration::from_millis((base_ms + jitter_ms).min(500))
}
