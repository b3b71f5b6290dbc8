//! Idempotency service (C9): two-tier duplicate detection (hot cache +
//! durable record) with race protection on concurrent first-seen inserts.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::IdempotencyConfig;
use crate::coordination::CoordinationStore;
use crate::durable::DurableStore;
use crate::error::CoreError;
use crate::model::{IdempotencyRecord, IdempotencyStatus, PartitionKey};

#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyOutcome {
    /// First time seeing this key (or its prior attempt is eligible for
    /// retry): a PROCESSING record now guards it, the caller should run
    /// the pipeline and call [`IdempotencyService::mark_completed`] or
    /// [`IdempotencyService::mark_failed`] when done.
    Proceed(IdempotencyRecord),
    /// Another attempt is in flight for this key.
    DuplicateProcessing,
    /// This key already completed, within the idempotency window.
    DuplicateCompleted(Option<String>),
}

#[derive(Serialize, Deserialize)]
struct CachedState {
    status: IdempotencyStatus,
    swap_blotter_ref: Option<String>,
}

pub struct IdempotencyService {
    coordination: Arc<dyn CoordinationStore>,
    durable: Arc<dyn DurableStore>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        durable: Arc<dyn DurableStore>,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            coordination,
            durable,
            config,
        }
    }

    fn cache_key(key: &str) -> String {
        format!("idempotency:{key}")
    }

    async fn write_cache(&self, key: &str, status: IdempotencyStatus, swap_blotter_ref: Option<String>) {
        let payload = CachedState {
            status,
            swap_blotter_ref,
        };
        if let Ok(bytes) = serde_json::to_vec(&payload) {
            let _ = self
                .coordination
                .set(&Self::cache_key(key), bytes, Some(self.config.cache_ttl))
                .await;
        }
    }

    /// Resolve the idempotency key (defaulting to `trade_id`) and check
    /// or create its guard record.
    pub async fn check_or_create(
        &self,
        trade_id: &str,
        idempotency_key: Option<&str>,
        partition_key: &PartitionKey,
    ) -> Result<IdempotencyOutcome, CoreError> {
        let key = idempotency_key.unwrap_or(trade_id).to_string();

        if let Some(bytes) = self.coordination.get(&Self::cache_key(&key)).await? {
            if let Ok(cached) = serde_json::from_slice::<CachedState>(&bytes) {
                if cached.status == IdempotencyStatus::Completed {
                    return Ok(IdempotencyOutcome::DuplicateCompleted(cached.swap_blotter_ref));
                }
            }
        }

        match self.durable.find_idempotency(&key).await? {
            Some(existing) if existing.status == IdempotencyStatus::Processing => {
                self.write_cache(&key, IdempotencyStatus::Processing, None).await;
                Ok(IdempotencyOutcome::DuplicateProcessing)
            }
            Some(existing) if existing.is_unexpired_completed() => {
                self.write_cache(&key, IdempotencyStatus::Completed, existing.swap_blotter_ref.clone())
                    .await;
                Ok(IdempotencyOutcome::DuplicateCompleted(existing.swap_blotter_ref))
            }
            Some(_stale) => {
                // Previously failed, or completed but outside the window: the
                // key is eligible for a fresh attempt. Re-arm the existing row
                // rather than inserting, since the key is already taken.
                self.durable
                    .mark_idempotency(&key, IdempotencyStatus::Processing, None, None)
                    .await?;
                self.write_cache(&key, IdempotencyStatus::Processing, None).await;
                let record = IdempotencyRecord::new_processing(
                    key,
                    trade_id.to_string(),
                    partition_key.clone(),
                    chrono::Duration::from_std(self.config.window).unwrap_or(chrono::Duration::hours(24)),
                );
                Ok(IdempotencyOutcome::Proceed(record))
            }
            None => {
                let record = IdempotencyRecord::new_processing(
                    key.clone(),
                    trade_id.to_string(),
                    partition_key.clone(),
                    chrono::Duration::from_std(self.config.window).unwrap_or(chrono::Duration::hours(24)),
                );
                match self.durable.upsert_idempotency(record.clone()).await {
                    Ok(()) => {
                        self.write_cache(&key, IdempotencyStatus::Processing, None).await;
                        Ok(IdempotencyOutcome::Proceed(record))
                    }
                    Err(CoreError::DuplicateTrade(_)) => {
                        let existing = self
                            .durable
                            .find_idempotency(&key)
                            .await?
                            .ok_or_else(|| CoreError::Internal("idempotency race with no winner".into()))?;
                        if existing.is_unexpired_completed() {
                            self.write_cache(&key, IdempotencyStatus::Completed, existing.swap_blotter_ref.clone())
                                .await;
                            Ok(IdempotencyOutcome::DuplicateCompleted(existing.swap_blotter_ref))
                        } else {
                            self.write_cache(&key, IdempotencyStatus::Processing, None).await;
                            Ok(IdempotencyOutcome::DuplicateProcessing)
                        }
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }

    pub async fn mark_completed(&self, key: &str, swap_blotter_ref: String) -> Result<(), CoreError> {
        self.durable
            .mark_idempotency(key, IdempotencyStatus::Completed, Some(swap_blotter_ref.clone()), Some(Utc::now()))
            .await?;
        self.write_cache(key, IdempotencyStatus::Completed, Some(swap_blotter_ref)).await;
        Ok(())
    }

    pub async fn mark_failed(&self, key: &str) -> Result<(), CoreError> {
        self.durable
            .mark_idempotency(key, IdempotencyStatus::Failed, None, Some(Utc::now()))
            .await?;
        self.write_cache(key, IdempotencyStatus::Failed, None).await;
        Ok(())
    }
}
