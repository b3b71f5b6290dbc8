//! Trade-capture orchestrator (C16): drives a single message through the
//! full pipeline under a partition lock.
//!
//! Per-message steps: logging context, partition lock, rate limit,
//! sequence validation, idempotency guard, enrichment, rules, validation,
//! approval workflow, CDM state transition, persistence, output publish,
//! and processing-metadata stamping. Any failure marks the idempotency
//! guard FAILED and returns a typed [`ErrorDetail`]; the partition lock is
//! always released. A still-pending approval is the one exception: it
//! returns the current blotter and leaves the idempotency guard
//! PROCESSING rather than failing it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::config::LockConfig;
use crate::coordination::lock::{AcquireOutcome, PartitionLockService};
use crate::coordination::rate_limit::RateLimiter;
use crate::durable::DurableStore;
use crate::enrichment::{EnrichedData, EnrichmentService};
use crate::error::{CoreError, ErrorDetail};
use crate::idempotency::{IdempotencyOutcome, IdempotencyService};
use crate::model::{
    PartitionKey, PositionState, ProcessingMetadata, SwapBlotter, TradeCaptureMessage, WorkflowStatus,
};
use crate::output::OutputPublisher;
use crate::refdata::{ApprovalDecision, ApprovalWorkflowClient};
use crate::rules::RulesEngine;
use crate::sequence::{OutOfOrderBuffer, SequenceDecision, SequenceValidator};
use crate::state_machine::StateMachineService;
use crate::telemetry::{self, Counters};
use crate::validation::ValidationService;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Processed in order and persisted.
    Success(SwapBlotter),
    /// Processed ahead of its window lookback, without waiting for
    /// predecessors.
    ProcessedOutOfOrder(SwapBlotter),
    /// Arrived ahead of its predecessors; held in the out-of-order buffer.
    Buffered,
    /// Already seen (in flight or completed) for this idempotency key,
    /// carrying the cached swap-blotter reference when one exists.
    Duplicate(Option<String>),
    /// Terminal and unprocessable as submitted: workflow rejection or a
    /// sequence the out-of-order buffer can never reconcile. DLQ-bound.
    Rejected(ErrorDetail),
    /// Approval is still outstanding; the current blotter is returned but
    /// the idempotency record stays PROCESSING so a later drain/retry can
    /// complete it.
    PendingApproval(SwapBlotter),
    Failed(ErrorDetail),
}

pub struct TradeCaptureOrchestrator {
    locks: PartitionLockService,
    lock_config: LockConfig,
    rate_limiter: RateLimiter,
    sequence: SequenceValidator,
    out_of_order: Arc<OutOfOrderBuffer>,
    idempotency: IdempotencyService,
    enrichment: EnrichmentService,
    rules: RulesEngine,
    validation: ValidationService,
    state_machine: StateMachineService,
    approval: Arc<dyn ApprovalWorkflowClient>,
    durable: Arc<dyn DurableStore>,
    output: OutputPublisher,
    counters: Arc<Counters>,
}

#[allow(clippy::too_many_arguments)]
impl TradeCaptureOrchestrator {
    pub fn new(
        locks: PartitionLockService,
        lock_config: LockConfig,
        rate_limiter: RateLimiter,
        sequence: SequenceValidator,
        out_of_order: Arc<OutOfOrderBuffer>,
        idempotency: IdempotencyService,
        enrichment: EnrichmentService,
        rules: RulesEngine,
        validation: ValidationService,
        state_machine: StateMachineService,
        approval: Arc<dyn ApprovalWorkflowClient>,
        durable: Arc<dyn DurableStore>,
        output: OutputPublisher,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            locks,
            lock_config,
            rate_limiter,
            sequence,
            out_of_order,
            idempotency,
            enrichment,
            rules,
            validation,
            state_machine,
            approval,
            durable,
            output,
            counters,
        }
    }

    /// After an in-order message advances `lastProcessedSequence` to
    /// `last_processed`, drain any now-contiguous buffered successors and
    /// run each through the pipeline in turn.
    pub async fn drain_buffered(&self, partition_key: &PartitionKey, last_processed: u64) -> Vec<ProcessOutcome> {
        let drained = self.out_of_order.drain_contiguous(partition_key, last_processed).await;
        let mut outcomes = Vec::with_capacity(drained.len());
        for (_, message) in drained {
            outcomes.push(self.process(message).await);
        }
        outcomes
    }

    /// Drive `message` through the full pipeline, always returning an
    /// outcome rather than propagating an error.
    pub async fn process(&self, message: TradeCaptureMessage) -> ProcessOutcome {
        let partition_key = message.partition_key();
        let span = telemetry::message_span(&message.trade_id, partition_key.as_str());
        let _enter = span.enter();

        let (lock_outcome, handle) = match self
            .locks
            .acquire(&partition_key, self.lock_config.default_hold, self.lock_config.default_wait)
            .await
        {
            Ok(v) => v,
            Err(err) => return self.record_failure(&err),
        };
        if lock_outcome == AcquireOutcome::Timeout {
            return self.record_failure(&CoreError::LockAcquisitionTimeout(partition_key.clone()));
        }
        let handle = handle.expect("Acquired outcome always carries a handle");

        let start = Instant::now();
        let result = self.process_locked(&message, &partition_key, start).await;

        let _ = self.locks.release(&handle).await;

        match result {
            Ok(outcome) => outcome,
            Err((err, idempotency_key)) => {
                if let Some(key) = idempotency_key {
                    let _ = self.idempotency.mark_failed(&key).await;
                }
                self.record_failure(&err)
            }
        }
    }

    /// Converts a propagated error into its outcome kind: workflow
    /// rejections and sequence errors the buffer can never reconcile are
    /// REJECTED (terminal, DLQ-bound); everything else is FAILED.
    fn record_failure(&self, err: &CoreError) -> ProcessOutcome {
        self.counters.processing_failures.fetch_add(1, Ordering::Relaxed);
        let detail = ErrorDetail::from_core_error(err);
        match err {
            CoreError::WorkflowRejected(_)
            | CoreError::SequenceOutOfOrderTooOld { .. }
            | CoreError::SequenceGapTooLarge { .. } => ProcessOutcome::Rejected(detail),
            _ => ProcessOutcome::Failed(detail),
        }
    }

    async fn process_locked(
        &self,
        message: &TradeCaptureMessage,
        partition_key: &PartitionKey,
        start: Instant,
    ) -> Result<ProcessOutcome, (CoreError, Option<String>)> {
        let decision = self.rate_limiter.check(partition_key).await;
        if let Some(err) = RateLimiter::to_core_error(decision, partition_key) {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Err((err, None));
        }

        let sequence = message.sequence_number.unwrap_or(0);
        let sequence_decision = self
            .sequence
            .classify(partition_key, sequence, message.booking_timestamp())
            .await
            .map_err(|e| (e, None))?;

        if sequence_decision == SequenceDecision::Buffered {
            self.out_of_order.insert(partition_key, sequence, message.clone()).await;
            return Ok(ProcessOutcome::Buffered);
        }

        let idempotency_outcome = self
            .idempotency
            .check_or_create(&message.trade_id, message.idempotency_key.as_deref(), partition_key)
            .await
            .map_err(|e| (e, None))?;

        let record = match idempotency_outcome {
            IdempotencyOutcome::Proceed(record) => record,
            IdempotencyOutcome::DuplicateProcessing => {
                self.counters.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
                return Ok(ProcessOutcome::Duplicate(None));
            }
            IdempotencyOutcome::DuplicateCompleted(swap_blotter_ref) => {
                self.counters.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
                return Ok(ProcessOutcome::Duplicate(swap_blotter_ref));
            }
        };
        let guard_key = record.idempotency_key;

        self.run_pipeline(message, partition_key, sequence, sequence_decision, &guard_key, start)
            .await
            .map_err(|err| (err, Some(guard_key)))
    }

    /// Enrichment through output publish and processing-metadata stamping.
    async fn run_pipeline(
        &self,
        message: &TradeCaptureMessage,
        partition_key: &PartitionKey,
        sequence: u64,
        sequence_decision: SequenceDecision,
        idempotency_key: &str,
        start: Instant,
    ) -> Result<ProcessOutcome, CoreError> {
        let (enrichment_status, enriched) = self.enrichment.enrich(message).await;

        let mut blotter = SwapBlotter {
            trade_id: message.trade_id.clone(),
            partition_key: partition_key.clone(),
            trade_lots: message.trade_lots.clone(),
            contract: format!("{}/{}/{}", message.account_id, message.book_id, message.security_id),
            state: PositionState::Executed,
            enrichment_status,
            workflow_status: WorkflowStatus::PendingApproval,
            processing_metadata: ProcessingMetadata::new(),
            version: 0,
            archive_flag: false,
        };

        let trade_data = trade_data_json(message, &enriched);
        let rules_outcome = self.rules.evaluate(&trade_data).await?;
        if let Some(status) = rules_outcome.workflow_status {
            blotter.workflow_status = status;
        }
        blotter.processing_metadata.rules_applied = rules_outcome.rules_applied;
        blotter.processing_metadata.sources = enrichment_sources(&enriched);

        self.validation.validate(message)?;

        if blotter.workflow_status == WorkflowStatus::PendingApproval {
            blotter.workflow_status = match self.approval.submit(&message.trade_id).await? {
                ApprovalDecision::Approved => WorkflowStatus::Approved,
                ApprovalDecision::Rejected => WorkflowStatus::Rejected,
                ApprovalDecision::Pending => WorkflowStatus::PendingApproval,
            };
        }
        match blotter.workflow_status {
            WorkflowStatus::Rejected => return Err(CoreError::WorkflowRejected(message.trade_id.clone())),
            // Still pending: leave the idempotency record PROCESSING (not
            // FAILED) and hand back the current blotter rather than erroring.
            WorkflowStatus::PendingApproval => return Ok(ProcessOutcome::PendingApproval(blotter)),
            WorkflowStatus::Approved => {}
        }

        let current_state = self.state_machine.current_state(partition_key).await?;
        let target_state = match current_state.as_ref().map(|s| s.position_state) {
            None => PositionState::Executed,
            Some(PositionState::Executed) => PositionState::Formed,
            Some(retained) => retained,
        };
        let transitioned = self.state_machine.transition(partition_key, target_state).await?;
        blotter.state = transitioned.position_state;

        let mut persisted = self.durable.upsert_swap_blotter(blotter).await?;

        if sequence_decision == SequenceDecision::InOrder {
            self.sequence
                .advance(partition_key, sequence, transitioned.position_state, transitioned.version)
                .await?;
        }

        self.idempotency
            .mark_completed(idempotency_key, persisted.trade_id.clone())
            .await?;

        self.output.publish(&persisted).await?;

        persisted.processing_metadata.processed_at = chrono::Utc::now();
        persisted.processing_metadata.processing_time_ms = start.elapsed().as_millis() as u64;

        self.counters.messages_processed.fetch_add(1, Ordering::Relaxed);

        Ok(if sequence_decision == SequenceDecision::ProcessOutOfOrder {
            ProcessOutcome::ProcessedOutOfOrder(persisted)
        } else {
            ProcessOutcome::Success(persisted)
        })
    }
}

fn enrichment_sources(enriched: &EnrichedData) -> Vec<String> {
    let mut sources = Vec::new();
    if enriched.security.is_some() {
        sources.push("security-master".to_string());
    }
    if enriched.account.is_some() {
        sources.push("account-master".to_string());
    }
    sources
}

fn trade_data_json(message: &TradeCaptureMessage, enriched: &EnrichedData) -> serde_json::Value {
    serde_json::json!({
        "tradeId": message.trade_id,
        "accountId": message.account_id,
        "bookId": message.book_id,
        "securityId": message.security_id,
        "source": message.source,
        "counterpartyIds": message.counterparty_ids,
        "security": enriched.security,
        "account": enriched.account,
    })
}
