//! End-to-end scenarios driving the orchestrator through the in-memory
//! durable store, coordination store, and log broker stack, the same way
//! `internal_transfer::integration_tests` exercises a full transfer
//! against in-memory collaborators rather than mocking each service.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use trade_capture_core::broker::log_broker::LogBroker;
use trade_capture_core::broker::BrokerAdapter;
use trade_capture_core::config::{
    BucketConfig, CacheConfig, IdempotencyConfig, LockConfig, RateLimitConfig, RefDataClientConfig,
    ReferenceDataConfig, SequenceConfig,
};
use trade_capture_core::coordination::lock::PartitionLockService;
use trade_capture_core::coordination::memory::InMemoryCoordinationStore;
use trade_capture_core::coordination::rate_limit::RateLimiter;
use trade_capture_core::dlq::DlqService;
use trade_capture_core::durable::memory::MemoryDurableStore;
use trade_capture_core::durable::DurableStore;
use trade_capture_core::enrichment::EnrichmentService;
use trade_capture_core::error::CoreError;
use trade_capture_core::idempotency::IdempotencyService;
use trade_capture_core::model::{EnrichmentStatus, PositionState, PriceQuantity, Source, TradeCaptureMessage, TradeLot};
use trade_capture_core::output::OutputPublisher;
use trade_capture_core::refdata::mock::{MockAccountMasterClient, MockApprovalWorkflowClient, MockSecurityMasterClient};
use trade_capture_core::refdata::{
    AccountMasterClient, ApprovalDecision, ApprovalWorkflowClient, ResilientSecurityMasterClient, SecurityMasterClient,
    SecurityRecord,
};
use trade_capture_core::rules::{RuleRepository, RulesEngine, YamlRuleRepository};
use trade_capture_core::sequence::{MessageDrainSink, OutOfOrderBuffer, SequenceValidator};
use trade_capture_core::state_machine::StateMachineService;
use trade_capture_core::telemetry::Counters;
use trade_capture_core::validation::ValidationService;
use trade_capture_core::{ProcessOutcome, TradeCaptureOrchestrator};

const APPROVE_ALL_RULES: &str = r#"
- id: approve-all
  rule_type: WORKFLOW
  priority: 1
  criteria:
    - field: tradeId
      operator: EXISTS
  actions:
    - type: SET_WORKFLOW_STATUS
      status: Approved
"#;

fn sequence_config(buffer_window_size: u64) -> SequenceConfig {
    SequenceConfig {
        buffer_enabled: true,
        buffer_window_size,
        buffer_timeout: Duration::from_secs(300),
        time_window_days: 7,
    }
}

fn ref_config() -> ReferenceDataConfig {
    ReferenceDataConfig {
        security: CacheConfig {
            ttl: Duration::from_secs(300),
        },
        account: CacheConfig {
            ttl: Duration::from_secs(300),
        },
        client: RefDataClientConfig {
            timeout: Duration::from_millis(50),
            max_retries: 0,
            retry_backoff: Duration::from_millis(1),
            circuit_failure_threshold: 3,
            circuit_success_threshold: 1,
            circuit_open_timeout: Duration::from_millis(20),
        },
    }
}

fn generous_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        global: BucketConfig {
            requests_per_second: 1000.0,
            burst_size: 1000,
        },
        per_partition: BucketConfig {
            requests_per_second: 1000.0,
            burst_size: 1000,
        },
    }
}

fn message(trade_id: &str, security_id: &str, sequence: u64) -> TradeCaptureMessage {
    TradeCaptureMessage {
        trade_id: trade_id.into(),
        account_id: "A".into(),
        book_id: "B".into(),
        security_id: security_id.into(),
        source: Source::Automated,
        trade_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        trade_timestamp: chrono::Utc::now(),
        booking_timestamp: None,
        sequence_number: Some(sequence),
        idempotency_key: None,
        counterparty_ids: vec!["C1".into(), "C2".into()],
        trade_lots: vec![TradeLot {
            lot_ids: vec!["L1".into()],
            price_quantities: vec![PriceQuantity {
                quantity: rust_decimal::Decimal::new(10000, 0),
                quantity_unit: "SHARES".into(),
                price: rust_decimal::Decimal::new(15025, 2),
                price_unit: "USD".into(),
            }],
        }],
        metadata: Default::default(),
        manual_entry: None,
    }
}

struct Harness {
    orchestrator: TradeCaptureOrchestrator,
    durable: Arc<MemoryDurableStore>,
}

fn harness(buffer_window_size: u64, rate_limit: RateLimitConfig) -> Harness {
    harness_custom(
        buffer_window_size,
        rate_limit,
        Arc::new(MockApprovalWorkflowClient) as Arc<dyn ApprovalWorkflowClient>,
        APPROVE_ALL_RULES,
    )
}

/// Like [`harness`] but with an empty rule set, so a newly-built blotter
/// reaches the approval-workflow step still PENDING_APPROVAL and the given
/// `approval` client's decision governs it.
fn harness_with_approval(
    buffer_window_size: u64,
    rate_limit: RateLimitConfig,
    approval: Arc<dyn ApprovalWorkflowClient>,
) -> Harness {
    harness_custom(buffer_window_size, rate_limit, approval, "[]")
}

fn harness_custom(
    buffer_window_size: u64,
    rate_limit: RateLimitConfig,
    approval: Arc<dyn ApprovalWorkflowClient>,
    rules_yaml: &str,
) -> Harness {
    let durable = Arc::new(MemoryDurableStore::new());
    let coordination = Arc::new(InMemoryCoordinationStore::new());
    let broker: Arc<dyn BrokerAdapter> = Arc::new(LogBroker::new(4));
    let counters = Arc::new(Counters::new());
    let rules = RulesEngine::new(Arc::new(YamlRuleRepository::from_yaml(rules_yaml).unwrap()) as Arc<dyn RuleRepository>);

    let orchestrator = TradeCaptureOrchestrator::new(
        PartitionLockService::new(coordination.clone()),
        LockConfig {
            default_hold: Duration::from_secs(30),
            default_wait: Duration::from_millis(50),
        },
        RateLimiter::new(coordination.clone(), rate_limit.global, rate_limit.per_partition),
        SequenceValidator::new(durable.clone(), sequence_config(buffer_window_size)),
        Arc::new(OutOfOrderBuffer::new()),
        IdempotencyService::new(
            coordination.clone(),
            durable.clone(),
            IdempotencyConfig {
                window: Duration::from_secs(3600),
                cache_ttl: Duration::from_secs(3600),
            },
        ),
        EnrichmentService::new(
            coordination.clone(),
            Arc::new(MockSecurityMasterClient) as Arc<dyn SecurityMasterClient>,
            Arc::new(MockAccountMasterClient) as Arc<dyn AccountMasterClient>,
            ref_config(),
        ),
        rules,
        ValidationService::new(),
        StateMachineService::new(coordination.clone(), durable.clone(), Duration::from_secs(60)),
        approval,
        durable.clone() as Arc<dyn DurableStore>,
        OutputPublisher::new(broker, "trade-capture-blotter".into(), vec![]),
        counters,
    );

    Harness { orchestrator, durable }
}

/// Scenario 1: happy path, AUTOMATED source.
#[tokio::test]
async fn happy_path_automated_trade_succeeds() {
    let h = harness(1000, generous_rate_limit());

    let outcome = h.orchestrator.process(message("T1", "US1234567890", 1)).await;
    let blotter = match outcome {
        ProcessOutcome::Success(blotter) => blotter,
        other => panic!("expected Success, got {other:?}"),
    };

    assert_eq!(blotter.enrichment_status, EnrichmentStatus::Complete);
    assert_eq!(
        blotter.workflow_status,
        trade_capture_core::model::WorkflowStatus::Approved
    );
    assert_eq!(blotter.state, PositionState::Executed);
    assert!(!blotter.processing_metadata.rules_applied.is_empty());

    let partition_key = blotter.partition_key.clone();
    let state = h.durable.find_partition_state(&partition_key, false).await.unwrap().unwrap();
    assert_eq!(state.last_processed_sequence, 1);
}

/// Scenario 2: resubmitting the same trade returns DUPLICATE without a
/// second persistence, and the idempotency record stays COMPLETED.
#[tokio::test]
async fn duplicate_resubmission_is_rejected_without_reprocessing() {
    let h = harness(1000, generous_rate_limit());

    let first = h.orchestrator.process(message("T1", "US1234567890", 1)).await;
    assert!(matches!(first, ProcessOutcome::Success(_)));

    let second = h.orchestrator.process(message("T1", "US1234567890", 2)).await;
    assert_eq!(second, ProcessOutcome::Duplicate(Some("T1".into())));

    let record = h.durable.find_idempotency("T1").await.unwrap().unwrap();
    assert_eq!(record.status, trade_capture_core::model::IdempotencyStatus::Completed);
}

/// Scenario 3: a message arriving ahead of its predecessors is buffered,
/// then drains to SUCCESS once the gap closes.
#[tokio::test]
async fn out_of_order_arrival_buffers_then_drains_on_gap_close() {
    let h = harness(1000, generous_rate_limit());
    let partition_key = message("T5", "US1234567890", 5).partition_key();

    let buffered = h.orchestrator.process(message("T5", "US1234567890", 5)).await;
    assert_eq!(buffered, ProcessOutcome::Buffered);
    assert!(h.durable.find_partition_state(&partition_key, false).await.unwrap().is_none());

    for seq in 1..=3 {
        let outcome = h
            .orchestrator
            .process(message(&format!("T{seq}"), "US1234567890", seq))
            .await;
        assert!(matches!(outcome, ProcessOutcome::Success(_)), "sequence {seq} should succeed");
    }

    // Sequence 4 is the one that makes 5 contiguous; draining afterwards
    // should pick up the buffered message and carry it to SUCCESS.
    let outcome = h.orchestrator.process(message("T4", "US1234567890", 4)).await;
    assert!(matches!(outcome, ProcessOutcome::Success(_)));

    let drained = h.orchestrator.drain_buffered(&partition_key, 4).await;
    assert_eq!(drained.len(), 1);
    assert!(matches!(drained[0], ProcessOutcome::Success(_)));

    let state = h.durable.find_partition_state(&partition_key, false).await.unwrap().unwrap();
    assert_eq!(state.last_processed_sequence, 5);
}

/// Scenario 4: a sequence far beyond the buffer window is rejected with
/// GAP_TOO_LARGE, and the outcome is the kind the ingestion loop routes to
/// the DLQ rather than retrying unchanged.
#[tokio::test]
async fn sequence_gap_beyond_buffer_window_is_rejected_and_dlq_eligible() {
    let h = harness(1000, generous_rate_limit());

    let outcome = h.orchestrator.process(message("T2000", "US1234567890", 2000)).await;
    let detail = match outcome {
        ProcessOutcome::Rejected(detail) => detail,
        other => panic!("expected Rejected, got {other:?}"),
    };
    assert_eq!(detail.code, "GAP_TOO_LARGE");

    // The same failed message, forwarded to the DLQ with its error code as
    // the reason header, is the hand-off the ingestion loop performs.
    let broker: Arc<dyn BrokerAdapter> = Arc::new(LogBroker::new(1));
    let counters = Arc::new(Counters::new());
    let dlq = DlqService::new(broker.clone(), "trade-capture-dlq".into(), counters);
    dlq.publish(
        &message("T2000", "US1234567890", 2000).partition_key(),
        "T2000",
        vec![0u8],
        &detail.code,
    )
    .await
    .unwrap();

    let sub = broker.subscribe("trade-capture-dlq").await.unwrap();
    let landed = broker.poll(sub).await.unwrap().unwrap();
    assert_eq!(landed.headers.get("errorReason").unwrap(), "GAP_TOO_LARGE");
}

/// Scenario 5: a burst past the per-partition token bucket admits exactly
/// the burst size before rejecting, and refills after an idle period.
#[tokio::test]
async fn per_partition_burst_admits_then_rejects_then_refills() {
    let tight_limit = RateLimitConfig {
        global: BucketConfig {
            requests_per_second: 1000.0,
            burst_size: 1000,
        },
        per_partition: BucketConfig {
            requests_per_second: 10.0,
            burst_size: 20,
        },
    };
    let h = harness(1000, tight_limit);

    let mut admitted = 0;
    let mut rejected = 0;
    for i in 0..25u64 {
        let outcome = h
            .orchestrator
            .process(message(&format!("T{i}"), "US1234567890", i + 1))
            .await;
        match outcome {
            ProcessOutcome::Success(_) | ProcessOutcome::Buffered => admitted += 1,
            ProcessOutcome::Failed(detail) if detail.code == "RATE_LIMIT_EXCEEDED" => rejected += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(admitted, 20);
    assert_eq!(rejected, 5);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let recovered = h.orchestrator.process(message("T_after_idle", "US1234567890", 21)).await;
    assert!(
        matches!(recovered, ProcessOutcome::Success(_) | ProcessOutcome::Buffered),
        "bucket should have refilled after idling, got {recovered:?}"
    );
}

struct AlwaysFailsSecurityClient;

#[async_trait::async_trait]
impl SecurityMasterClient for AlwaysFailsSecurityClient {
    async fn lookup(&self, _security_id: &str) -> Result<Option<SecurityRecord>, CoreError> {
        Err(CoreError::TransientStore("security-master unavailable".into()))
    }
}

/// Scenario 6: repeated reference-data failures trip the circuit breaker;
/// the pipeline still completes with a PARTIAL enrichment rather than
/// failing the trade, and the breaker re-closes after a probe succeeds.
#[tokio::test]
async fn circuit_breaker_trips_then_recovers_with_partial_enrichment() {
    let coordination: Arc<InMemoryCoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    let config = ref_config();
    let flaky: Arc<dyn SecurityMasterClient> = Arc::new(ResilientSecurityMasterClient::new(
        Arc::new(AlwaysFailsSecurityClient),
        config.client,
    ));
    let enrichment = EnrichmentService::new(
        coordination.clone(),
        flaky,
        Arc::new(MockAccountMasterClient) as Arc<dyn AccountMasterClient>,
        config,
    );

    // Drive the breaker past its failure threshold with distinct security
    // ids so the refdata cache never short-circuits the client call.
    let mut last_status = EnrichmentStatus::Complete;
    for i in 0..4 {
        let msg = message(&format!("T{i}"), &format!("US{i:010}"), 1);
        let (status, _) = enrichment.enrich(&msg).await;
        last_status = status;
    }
    assert_eq!(last_status, EnrichmentStatus::Partial);

    // Once open, calls short-circuit immediately without waiting on a
    // lookup; still PARTIAL.
    let (status, _) = enrichment.enrich(&message("T_open", "US9999999999", 1)).await;
    assert_eq!(status, EnrichmentStatus::Partial);

    // After the open timeout elapses the breaker probes again; since the
    // underlying client always fails here it stays open rather than
    // falsely recovering.
    tokio::time::sleep(Duration::from_millis(25)).await;
    let (status, _) = enrichment.enrich(&message("T_probe", "US8888888888", 1)).await;
    assert_eq!(status, EnrichmentStatus::Partial);
}

/// Exercises the out-of-order buffer's timeout sweep independently of the
/// orchestrator, confirming it lands on the DLQ with a timeout reason.
#[tokio::test]
async fn buffered_message_that_times_out_drains_to_dlq() {
    let broker: Arc<dyn BrokerAdapter> = Arc::new(LogBroker::new(1));
    let counters = Arc::new(Counters::new());
    let dlq: Arc<dyn MessageDrainSink> = Arc::new(DlqService::new(broker.clone(), "trade-capture-dlq".into(), counters));
    let buffer = OutOfOrderBuffer::new();

    let partition_key = message("T9", "US1234567890", 9).partition_key();
    buffer.insert(&partition_key, 9, message("T9", "US1234567890", 9)).await;

    buffer.sweep_timeouts(Duration::from_millis(0), dlq.as_ref()).await.unwrap();

    let sub = broker.subscribe("trade-capture-dlq").await.unwrap();
    let landed = broker.poll(sub).await.unwrap().unwrap();
    assert!(landed.headers.get("errorReason").unwrap().contains('9'));
}

struct StaticApprovalClient(ApprovalDecision);

#[async_trait::async_trait]
impl ApprovalWorkflowClient for StaticApprovalClient {
    async fn submit(&self, _trade_id: &str) -> Result<ApprovalDecision, CoreError> {
        Ok(self.0)
    }
}

/// A trade still awaiting approval comes back PENDING_APPROVAL with the
/// current blotter, and the idempotency record stays PROCESSING rather
/// than being marked FAILED.
#[tokio::test]
async fn still_pending_approval_returns_blotter_and_leaves_idempotency_processing() {
    let h = harness_with_approval(
        1000,
        generous_rate_limit(),
        Arc::new(StaticApprovalClient(ApprovalDecision::Pending)),
    );

    let outcome = h.orchestrator.process(message("T1", "US1234567890", 1)).await;
    match outcome {
        ProcessOutcome::PendingApproval(blotter) => {
            assert_eq!(blotter.trade_id, "T1");
            assert_eq!(blotter.workflow_status, trade_capture_core::model::WorkflowStatus::PendingApproval);
        }
        other => panic!("expected PendingApproval, got {other:?}"),
    }

    let record = h.durable.find_idempotency("T1").await.unwrap().unwrap();
    assert_eq!(record.status, trade_capture_core::model::IdempotencyStatus::Processing);
}

/// A trade the approval workflow rejects outright comes back REJECTED,
/// the outcome the ingestion loop DLQs unconditionally.
#[tokio::test]
async fn workflow_rejection_returns_rejected_outcome() {
    let h = harness_with_approval(
        1000,
        generous_rate_limit(),
        Arc::new(StaticApprovalClient(ApprovalDecision::Rejected)),
    );

    let outcome = h.orchestrator.process(message("T1", "US1234567890", 1)).await;
    match outcome {
        ProcessOutcome::Rejected(detail) => assert_eq!(detail.code, "REJECTED"),
        other => panic!("expected Rejected, got {other:?}"),
    }
}
