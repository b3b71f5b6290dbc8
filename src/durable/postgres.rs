//! Postgres-backed [`DurableStore`] (C2).
//!
//! CAS-style conditional updates (`UPDATE ... WHERE version = $n`) mirror
//! `internal_transfer::db::TransferDb::update_state_if`; connection
//! bring-up retries with exponential backoff the way
//! `internal_transfer_service::main` retries its ScyllaDB/TigerBeetle
//! connects.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;

use super::DurableStore;
use crate::error::CoreError;
use crate::model::{
    IdempotencyRecord, IdempotencyStatus, PartitionKey, PartitionState, PositionState, SwapBlotter,
};

pub struct PostgresDurableStore {
    pool: PgPool,
    deadlock_retries: DeadlockRetryPolicy,
}

#[derive(Debug, Clone, Copy)]
pub struct DeadlockRetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DeadlockRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Postgres error code for a detected deadlock (`deadlock_detected`).
const PG_DEADLOCK_CODE: &str = "40P01";

impl PostgresDurableStore {
    pub fn new(pool: PgPool, deadlock_retries: DeadlockRetryPolicy) -> Self {
        Self {
            pool,
            deadlock_retries,
        }
    }

    /// Connect with bounded retry + exponential backoff.
    pub async fn connect(
        database_url: &str,
        max_attempts: u32,
        deadlock_retries: DeadlockRetryPolicy,
    ) -> Result<Self, CoreError> {
        let mut delay = Duration::from_millis(200);
        let mut last_err = None;

        for attempt in 1..=max_attempts.max(1) {
            match PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    let store = Self::new(pool, deadlock_retries);
                    store.bootstrap_schema().await?;
                    return Ok(store);
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "durable store connect attempt failed");
                    last_err = Some(err);
                    if attempt < max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(30));
                    }
                }
            }
        }

        Err(CoreError::FatalConfig(format!(
            "could not connect to durable store after {max_attempts} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn bootstrap_schema(&self) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency_records (
                idempotency_key TEXT PRIMARY KEY,
                trade_id TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                status TEXT NOT NULL,
                swap_blotter_ref TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                expires_at TIMESTAMPTZ NOT NULL,
                archive_flag BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS partition_state (
                partition_key TEXT PRIMARY KEY,
                position_state TEXT NOT NULL,
                last_processed_sequence BIGINT NOT NULL,
                state_blob JSONB NOT NULL,
                version BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                archive_flag BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_blotters (
                trade_id TEXT PRIMARY KEY,
                partition_key TEXT NOT NULL,
                trade_lots JSONB NOT NULL,
                contract TEXT NOT NULL,
                state TEXT NOT NULL,
                enrichment_status TEXT NOT NULL,
                workflow_status TEXT NOT NULL,
                processing_metadata JSONB NOT NULL,
                version BIGINT NOT NULL,
                archive_flag BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn with_deadlock_retry<T, F, Fut>(&self, mut unit_of_work: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let mut delay = self.deadlock_retries.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match unit_of_work().await {
                Ok(value) => return Ok(value),
                Err(CoreError::Deadlock(reason)) if attempt < self.deadlock_retries.max_attempts => {
                    tracing::warn!(attempt, %reason, "retrying after deadlock");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.deadlock_retries.max_backoff);
                }
                Err(CoreError::Deadlock(reason)) => {
                    return Err(CoreError::Deadlock(format!(
                        "exhausted {} attempts: {reason}",
                        self.deadlock_retries.max_attempts
                    )));
                }
                Err(other) => return Err(other),
            }
        }
    }
}

fn map_sqlx_err(err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(PG_DEADLOCK_CODE) {
            return CoreError::Deadlock(db_err.message().to_string());
        }
    }
    CoreError::TransientStore(err.to_string())
}

fn idempotency_status_str(status: IdempotencyStatus) -> &'static str {
    match status {
        IdempotencyStatus::Processing => "PROCESSING",
        IdempotencyStatus::Completed => "COMPLETED",
        IdempotencyStatus::Failed => "FAILED",
    }
}

fn parse_idempotency_status(raw: &str) -> Result<IdempotencyStatus, CoreError> {
    match raw {
        "PROCESSING" => Ok(IdempotencyStatus::Processing),
        "COMPLETED" => Ok(IdempotencyStatus::Completed),
        "FAILED" => Ok(IdempotencyStatus::Failed),
        other => Err(CoreError::Internal(format!("unknown idempotency status {other}"))),
    }
}

fn position_state_str(state: PositionState) -> &'static str {
    match state {
        PositionState::Executed => "EXECUTED",
        PositionState::Formed => "FORMED",
        PositionState::Settled => "SETTLED",
        PositionState::Cancelled => "CANCELLED",
        PositionState::Closed => "CLOSED",
    }
}

fn parse_position_state(raw: &str) -> Result<PositionState, CoreError> {
    match raw {
        "EXECUTED" => Ok(PositionState::Executed),
        "FORMED" => Ok(PositionState::Formed),
        "SETTLED" => Ok(PositionState::Settled),
        "CANCELLED" => Ok(PositionState::Cancelled),
        "CLOSED" => Ok(PositionState::Closed),
        other => Err(CoreError::Internal(format!("unknown position state {other}"))),
    }
}

#[async_trait::async_trait]
impl DurableStore for PostgresDurableStore {
    async fn upsert_idempotency(&self, record: IdempotencyRecord) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_records
                (idempotency_key, trade_id, partition_key, status, swap_blotter_ref,
                 created_at, completed_at, expires_at, archive_flag)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(&record.idempotency_key)
        .bind(&record.trade_id)
        .bind(record.partition_key.as_str())
        .bind(idempotency_status_str(record.status))
        .bind(&record.swap_blotter_ref)
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(record.expires_at)
        .bind(record.archive_flag)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::DuplicateTrade(record.idempotency_key));
        }
        Ok(())
    }

    async fn find_idempotency(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT idempotency_key, trade_id, partition_key, status, swap_blotter_ref,
                   created_at, completed_at, expires_at, archive_flag
            FROM idempotency_records WHERE idempotency_key = $1
            "#,
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.map(|row| {
            Ok(IdempotencyRecord {
                idempotency_key: row.try_get("idempotency_key").map_err(map_sqlx_err)?,
                trade_id: row.try_get("trade_id").map_err(map_sqlx_err)?,
                partition_key: PartitionKey::from_stored(
                    row.try_get::<String, _>("partition_key").map_err(map_sqlx_err)?,
                ),
                status: parse_idempotency_status(
                    &row.try_get::<String, _>("status").map_err(map_sqlx_err)?,
                )?,
                swap_blotter_ref: row.try_get("swap_blotter_ref").map_err(map_sqlx_err)?,
                created_at: row.try_get("created_at").map_err(map_sqlx_err)?,
                completed_at: row.try_get("completed_at").map_err(map_sqlx_err)?,
                expires_at: row.try_get("expires_at").map_err(map_sqlx_err)?,
                archive_flag: row.try_get("archive_flag").map_err(map_sqlx_err)?,
            })
        })
        .transpose()
    }

    async fn mark_idempotency(
        &self,
        idempotency_key: &str,
        status: IdempotencyStatus,
        swap_blotter_ref: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        self.with_deadlock_retry(|| async {
            let result = sqlx::query(
                r#"
                UPDATE idempotency_records
                SET status = $1, swap_blotter_ref = COALESCE($2, swap_blotter_ref), completed_at = $3
                WHERE idempotency_key = $4
                "#,
            )
            .bind(idempotency_status_str(status))
            .bind(&swap_blotter_ref)
            .bind(completed_at)
            .bind(idempotency_key)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

            if result.rows_affected() == 0 {
                return Err(CoreError::NotFound(format!("idempotency key {idempotency_key}")));
            }
            Ok(())
        })
        .await
    }

    async fn find_partition_state(
        &self,
        partition_key: &PartitionKey,
        for_update: bool,
    ) -> Result<Option<PartitionState>, CoreError> {
        let row = if for_update {
            sqlx::query(
                r#"
                SELECT partition_key, position_state, last_processed_sequence, state_blob,
                       version, updated_at, archive_flag
                FROM partition_state WHERE partition_key = $1 FOR UPDATE
                "#,
            )
            .bind(partition_key.as_str())
            .fetch_optional(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                SELECT partition_key, position_state, last_processed_sequence, state_blob,
                       version, updated_at, archive_flag
                FROM partition_state WHERE partition_key = $1
                "#,
            )
            .bind(partition_key.as_str())
            .fetch_optional(&self.pool)
            .await
        }
        .map_err(map_sqlx_err)?;

        row.map(|row| {
            Ok(PartitionState {
                partition_key: PartitionKey::from_stored(
                    row.try_get::<String, _>("partition_key").map_err(map_sqlx_err)?,
                ),
                position_state: parse_position_state(
                    &row.try_get::<String, _>("position_state").map_err(map_sqlx_err)?,
                )?,
                last_processed_sequence: row
                    .try_get::<i64, _>("last_processed_sequence")
                    .map_err(map_sqlx_err)? as u64,
                state_blob: row.try_get::<JsonValue, _>("state_blob").map_err(map_sqlx_err)?,
                version: row.try_get::<i64, _>("version").map_err(map_sqlx_err)? as u64,
                updated_at: row.try_get("updated_at").map_err(map_sqlx_err)?,
                archive_flag: row.try_get("archive_flag").map_err(map_sqlx_err)?,
            })
        })
        .transpose()
    }

    async fn upsert_partition_state(
        &self,
        partition_key: &PartitionKey,
        new_state: PositionState,
        last_sequence: u64,
        expected_version: u64,
    ) -> Result<PartitionState, CoreError> {
        self.with_deadlock_retry(|| async {
            if expected_version == 0 {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO partition_state
                        (partition_key, position_state, last_processed_sequence, state_blob,
                         version, updated_at, archive_flag)
                    VALUES ($1, $2, $3, 'null'::jsonb, 1, NOW(), FALSE)
                    ON CONFLICT (partition_key) DO NOTHING
                    "#,
                )
                .bind(partition_key.as_str())
                .bind(position_state_str(new_state))
                .bind(last_sequence as i64)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;

                if inserted.rows_affected() == 0 {
                    return Err(CoreError::VersionConflict(partition_key.to_string()));
                }
            } else {
                let updated = sqlx::query(
                    r#"
                    UPDATE partition_state
                    SET position_state = $1, last_processed_sequence = $2, version = version + 1,
                        updated_at = NOW()
                    WHERE partition_key = $3 AND version = $4
                    "#,
                )
                .bind(position_state_str(new_state))
                .bind(last_sequence as i64)
                .bind(partition_key.as_str())
                .bind(expected_version as i64)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;

                if updated.rows_affected() == 0 {
                    return Err(CoreError::VersionConflict(partition_key.to_string()));
                }
            }

            self.find_partition_state(partition_key, false)
                .await?
                .ok_or_else(|| CoreError::NotFound(partition_key.to_string()))
        })
        .await
    }

    async fn find_swap_blotter_by_trade_id(
        &self,
        trade_id: &str,
    ) -> Result<Option<SwapBlotter>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT trade_id, partition_key, trade_lots, contract, state, enrichment_status,
                   workflow_status, processing_metadata, version, archive_flag
            FROM swap_blotters WHERE trade_id = $1
            "#,
        )
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.map(row_to_blotter).transpose()
    }

    async fn upsert_swap_blotter(&self, blotter: SwapBlotter) -> Result<SwapBlotter, CoreError> {
        self.with_deadlock_retry(|| async {
            let trade_lots_json = serde_json::to_value(&blotter.trade_lots)
                .map_err(|e| CoreError::Internal(e.to_string()))?;
            let metadata_json = serde_json::to_value(&blotter.processing_metadata)
                .map_err(|e| CoreError::Internal(e.to_string()))?;

            if blotter.version == 0 {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO swap_blotters
                        (trade_id, partition_key, trade_lots, contract, state, enrichment_status,
                         workflow_status, processing_metadata, version, archive_flag)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9)
                    ON CONFLICT (trade_id) DO NOTHING
                    "#,
                )
                .bind(&blotter.trade_id)
                .bind(blotter.partition_key.as_str())
                .bind(&trade_lots_json)
                .bind(&blotter.contract)
                .bind(position_state_str(blotter.state))
                .bind(enrichment_status_str(blotter.enrichment_status))
                .bind(workflow_status_str(blotter.workflow_status))
                .bind(&metadata_json)
                .bind(blotter.archive_flag)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;

                if inserted.rows_affected() == 0 {
                    return Err(CoreError::VersionConflict(blotter.trade_id.clone()));
                }
            } else {
                let updated = sqlx::query(
                    r#"
                    UPDATE swap_blotters
                    SET partition_key = $1, trade_lots = $2, contract = $3, state = $4,
                        enrichment_status = $5, workflow_status = $6, processing_metadata = $7,
                        version = version + 1
                    WHERE trade_id = $8 AND version = $9
                    "#,
                )
                .bind(blotter.partition_key.as_str())
                .bind(&trade_lots_json)
                .bind(&blotter.contract)
                .bind(position_state_str(blotter.state))
                .bind(enrichment_status_str(blotter.enrichment_status))
                .bind(workflow_status_str(blotter.workflow_status))
                .bind(&metadata_json)
                .bind(&blotter.trade_id)
                .bind(blotter.version as i64)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;

                if updated.rows_affected() == 0 {
                    return Err(CoreError::VersionConflict(blotter.trade_id.clone()));
                }
            }

            self.find_swap_blotter_by_trade_id(&blotter.trade_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(blotter.trade_id.clone()))
        })
        .await
    }

    async fn archive_by_date_range(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE swap_blotters SET archive_flag = TRUE
            WHERE archive_flag = FALSE
              AND (processing_metadata->>'processed_at')::timestamptz < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn archive_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records SET archive_flag = TRUE
            WHERE archive_flag = FALSE AND expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }
}

fn enrichment_status_str(status: crate::model::EnrichmentStatus) -> &'static str {
    use crate::model::EnrichmentStatus::*;
    match status {
        Complete => "COMPLETE",
        Partial => "PARTIAL",
        Failed => "FAILED",
    }
}

fn workflow_status_str(status: crate::model::WorkflowStatus) -> &'static str {
    use crate::model::WorkflowStatus::*;
    match status {
        PendingApproval => "PENDING_APPROVAL",
        Approved => "APPROVED",
        Rejected => "REJECTED",
    }
}

fn row_to_blotter(row: sqlx::postgres::PgRow) -> Result<SwapBlotter, CoreError> {
    let enrichment_status = match row.try_get::<String, _>("enrichment_status").map_err(map_sqlx_err)?.as_str() {
        "COMPLETE" => crate::model::EnrichmentStatus::Complete,
        "PARTIAL" => crate::model::EnrichmentStatus::Partial,
        "FAILED" => crate::model::EnrichmentStatus::Failed,
        other => return Err(CoreError::Internal(format!("unknown enrichment status {other}"))),
    };
    let workflow_status = match row.try_get::<String, _>("workflow_status").map_err(map_sqlx_err)?.as_str() {
        "PENDING_APPROVAL" => crate::model::WorkflowStatus::PendingApproval,
        "APPROVED" => crate::model::WorkflowStatus::Approved,
        "REJECTED" => crate::model::WorkflowStatus::Rejected,
        other => return Err(CoreError::Internal(format!("unknown workflow status {other}"))),
    };

    Ok(SwapBlotter {
        trade_id: row.try_get("trade_id").map_err(map_sqlx_err)?,
        partition_key: PartitionKey::from_stored(
            row.try_get::<String, _>("partition_key").map_err(map_sqlx_err)?,
        ),
        trade_lots: serde_json::from_value(row.try_get("trade_lots").map_err(map_sqlx_err)?)
            .map_err(|e| CoreError::Internal(e.to_string()))?,
        contract: row.try_get("contract").map_err(map_sqlx_err)?,
        state: parse_position_state(&row.try_get::<String, _>("state").map_err(map_sqlx_err)?)?,
        enrichment_status,
        workflow_status,
        processing_metadata: serde_json::from_value(
            row.try_get("processing_metadata").map_err(map_sqlx_err)?,
        )
        .map_err(|e| CoreError::Internal(e.to_string()))?,
        version: row.try_get::<i64, _>("version").map_err(map_sqlx_err)? as u64,
        archive_flag: row.try_get("archive_flag").map_err(map_sqlx_err)?,
    })
}
