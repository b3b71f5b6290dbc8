//! Process entry point: loads configuration, wires every component, and
//! runs the router, orchestrator, and housekeeping loops until shutdown.
//!
//! Exit codes: 0 on clean shutdown, 2 on a fatal configuration error, 1 on
//! any other unhandled startup error.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use trade_capture_core::backpressure::BackpressureMonitor;
use trade_capture_core::broker::jms_broker::JmsBroker;
use trade_capture_core::broker::log_broker::LogBroker;
use trade_capture_core::broker::BrokerAdapter;
use trade_capture_core::config::{AppConfig, MessagingProvider, StoreProvider};
use trade_capture_core::coordination::lock::PartitionLockService;
use trade_capture_core::coordination::memory::InMemoryCoordinationStore;
use trade_capture_core::coordination::rate_limit::RateLimiter;
use trade_capture_core::coordination::CoordinationStore;
use trade_capture_core::dlq::DlqService;
use trade_capture_core::durable::memory::MemoryDurableStore;
use trade_capture_core::durable::postgres::{DeadlockRetryPolicy, PostgresDurableStore};
use trade_capture_core::durable::DurableStore;
use trade_capture_core::enrichment::EnrichmentService;
use trade_capture_core::idempotency::IdempotencyService;
use trade_capture_core::output::OutputPublisher;
#[cfg(feature = "mock-refdata")]
use trade_capture_core::refdata::mock::{MockAccountMasterClient, MockApprovalWorkflowClient, MockSecurityMasterClient};
use trade_capture_core::refdata::{
    AccountMasterClient, ApprovalWorkflowClient, ResilientAccountMasterClient, ResilientApprovalWorkflowClient,
    ResilientSecurityMasterClient, SecurityMasterClient,
};
use trade_capture_core::router::MessageRouter;
use trade_capture_core::rules::{RuleRepository, YamlRuleRepository};
use trade_capture_core::sequence::{OutOfOrderBuffer, SequenceValidator};
use trade_capture_core::state_machine::StateMachineService;
use trade_capture_core::telemetry::{self, Counters};
use trade_capture_core::{CoreError, ProcessOutcome, TradeCaptureOrchestrator};

const FATAL_CONFIG_EXIT: i32 = 2;
const STARTUP_FAILURE_EXIT: i32 = 1;

fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(err @ CoreError::FatalConfig(_)) => {
            eprintln!("fatal configuration error: {err}");
            std::process::exit(FATAL_CONFIG_EXIT);
        }
        Err(err) => {
            eprintln!("startup error: {err}");
            std::process::exit(STARTUP_FAILURE_EXIT);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start tokio runtime: {err}");
            std::process::exit(STARTUP_FAILURE_EXIT);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => std::process::exit(0),
        Err(err @ CoreError::FatalConfig(_)) => {
            eprintln!("fatal configuration error: {err}");
            std::process::exit(FATAL_CONFIG_EXIT);
        }
        Err(err) => {
            eprintln!("startup error: {err}");
            std::process::exit(STARTUP_FAILURE_EXIT);
        }
    }
}

fn load_config(path: &str) -> Result<AppConfig, CoreError> {
    if std::path::Path::new(path).exists() {
        AppConfig::from_file(path)
    } else {
        Ok(AppConfig::dev_default())
    }
}

async fn run(config: AppConfig) -> Result<(), CoreError> {
    let _logging_guard = telemetry::init_logging(&config.telemetry);
    tracing::info!("starting trade-capture-core");

    let counters = Arc::new(Counters::new());
    let coordination: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    let durable = build_durable_store(&config).await?;
    let broker = build_broker(&config);

    let router = Arc::new(MessageRouter::new(broker.clone(), config.messaging.topics.clone(), counters.clone()));
    let out_of_order = Arc::new(OutOfOrderBuffer::new());
    let dlq = Arc::new(DlqService::new(broker.clone(), config.messaging.topics.dlq.clone(), counters.clone()));

    let orchestrator = Arc::new(build_orchestrator(
        &config,
        coordination.clone(),
        durable.clone(),
        broker.clone(),
        out_of_order.clone(),
        counters.clone(),
    ));

    let queue_depth = Arc::new(AtomicUsize::new(0));
    let backpressure = Arc::new(BackpressureMonitor::new(broker.clone(), config.backpressure.clone(), queue_depth));

    let router_task = tokio::spawn(run_router_loop(router.clone()));
    let orchestrator_task = tokio::spawn(run_orchestrator_loop(
        broker.clone(),
        config.messaging.topics.partition_pattern.clone(),
        orchestrator.clone(),
        dlq.clone(),
    ));
    let sweep_task = tokio::spawn(run_sweep_loop(out_of_order.clone(), config.sequence.buffer_timeout, dlq.clone()));
    let archive_task = tokio::spawn(run_archive_loop(durable.clone()));
    let backpressure_task = tokio::spawn(run_backpressure_loop(
        backpressure,
        router.clone(),
        config.messaging.topics.partition_pattern.clone(),
    ));

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received, stopping loops");

    router_task.abort();
    orchestrator_task.abort();
    sweep_task.abort();
    archive_task.abort();
    backpressure_task.abort();
    broker.close().await?;

    Ok(())
}

async fn build_durable_store(config: &AppConfig) -> Result<Arc<dyn DurableStore>, CoreError> {
    match config.durable.provider {
        StoreProvider::Memory => Ok(Arc::new(MemoryDurableStore::new())),
        StoreProvider::Postgres => {
            let url = config
                .durable
                .database_url
                .as_deref()
                .ok_or_else(|| CoreError::FatalConfig("durable.provider=postgres requires durable.database_url".into()))?;
            let retries = DeadlockRetryPolicy {
                max_attempts: config.retries.deadlock.attempts,
                initial_backoff: config.retries.deadlock.initial_backoff,
                max_backoff: config.retries.deadlock.max_backoff,
            };
            let store = PostgresDurableStore::connect(url, config.durable.connect_max_attempts, retries).await?;
            Ok(Arc::new(store))
        }
    }
}

fn build_broker(config: &AppConfig) -> Arc<dyn BrokerAdapter> {
    match config.messaging.provider {
        MessagingProvider::Log => Arc::new(LogBroker::new(64)),
        MessagingProvider::Jms => Arc::new(JmsBroker::new()),
    }
}

fn build_orchestrator(
    config: &AppConfig,
    coordination: Arc<dyn CoordinationStore>,
    durable: Arc<dyn DurableStore>,
    broker: Arc<dyn BrokerAdapter>,
    out_of_order: Arc<OutOfOrderBuffer>,
    counters: Arc<Counters>,
) -> TradeCaptureOrchestrator {
    let (security_client, account_client, approval_client) = build_refdata_clients(config);

    TradeCaptureOrchestrator::new(
        PartitionLockService::new(coordination.clone()),
        config.lock.clone(),
        RateLimiter::new(coordination.clone(), config.rate_limit.global, config.rate_limit.per_partition),
        SequenceValidator::new(durable.clone(), config.sequence.clone()),
        out_of_order,
        IdempotencyService::new(coordination.clone(), durable.clone(), config.idempotency.clone()),
        EnrichmentService::new(coordination.clone(), security_client, account_client, config.reference_data.clone()),
        trade_capture_core::rules::RulesEngine::new(default_rule_repository()),
        trade_capture_core::validation::ValidationService::new(),
        StateMachineService::new(coordination, durable.clone(), config.reference_data.security.ttl),
        approval_client,
        durable,
        OutputPublisher::new(broker, config.messaging.topics.output.clone(), Vec::new()),
        counters,
    )
}

#[cfg(feature = "mock-refdata")]
fn build_refdata_clients(
    config: &AppConfig,
) -> (Arc<dyn SecurityMasterClient>, Arc<dyn AccountMasterClient>, Arc<dyn ApprovalWorkflowClient>) {
    let client_config = config.reference_data.client;
    (
        Arc::new(ResilientSecurityMasterClient::new(Arc::new(MockSecurityMasterClient), client_config)),
        Arc::new(ResilientAccountMasterClient::new(Arc::new(MockAccountMasterClient), client_config)),
        Arc::new(ResilientApprovalWorkflowClient::new(Arc::new(MockApprovalWorkflowClient), client_config)),
    )
}

/// Rules are loaded once at startup from an empty default set; operators
/// supply real rule definitions by pointing `RulesEngine` at a repository
/// backed by their own rule store (out of scope here — see spec's
/// Non-goals on a rule-authoring surface).
fn default_rule_repository() -> Arc<dyn RuleRepository> {
    Arc::new(YamlRuleRepository::from_yaml("[]").expect("empty rule set always parses"))
}

async fn run_router_loop(router: Arc<MessageRouter>) {
    let subscription = match router.subscribe_ingress().await {
        Ok(sub) => sub,
        Err(err) => {
            tracing::error!(error = %err, "router failed to subscribe to ingress topic");
            return;
        }
    };
    loop {
        match router.route_next(subscription).await {
            Ok(Some(_outcome)) => {}
            Ok(None) => tokio::time::sleep(Duration::from_millis(50)).await,
            Err(err) => tracing::warn!(error = %err, "router poll failed"),
        }
    }
}

async fn run_orchestrator_loop(
    broker: Arc<dyn BrokerAdapter>,
    partition_pattern: String,
    orchestrator: Arc<TradeCaptureOrchestrator>,
    dlq: Arc<DlqService>,
) {
    let wildcard = partition_pattern.replace("{partition}", "*");
    let subscription = match broker.subscribe(&wildcard).await {
        Ok(sub) => sub,
        Err(err) => {
            tracing::error!(error = %err, "orchestrator failed to subscribe to partition subtopics");
            return;
        }
    };

    loop {
        let polled = match broker.poll(subscription).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "orchestrator poll failed");
                continue;
            }
        };

        let decoded: trade_capture_core::model::TradeCaptureMessage = match trade_capture_core::model::wire::decode(&polled.bytes) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "dropping unparsable message from partition subtopic");
                let _ = broker.ack(subscription, &polled).await;
                continue;
            }
        };

        let partition_key = decoded.partition_key();
        let sequence = decoded.sequence_number.unwrap_or(0);
        let trade_id = decoded.trade_id.clone();
        let outcome = orchestrator.process(decoded).await;
        match outcome {
            ProcessOutcome::Success(_) => {
                orchestrator.drain_buffered(&partition_key, sequence).await;
            }
            ProcessOutcome::Rejected(detail) => {
                let _ = dlq.publish(&partition_key, &trade_id, polled.bytes.clone(), &detail.code).await;
            }
            ProcessOutcome::Failed(detail) if is_terminal(&detail.code) => {
                let _ = dlq.publish(&partition_key, &trade_id, polled.bytes.clone(), &detail.code).await;
            }
            _ => {}
        }
        let _ = broker.ack(subscription, &polled).await;
    }
}

async fn run_sweep_loop(out_of_order: Arc<OutOfOrderBuffer>, buffer_timeout: Duration, dlq: Arc<DlqService>) {
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        if let Err(err) = out_of_order.sweep_timeouts(buffer_timeout, dlq.as_ref()).await {
            tracing::warn!(error = %err, "out-of-order buffer sweep failed");
        }
    }
}

async fn run_archive_loop(durable: Arc<dyn DurableStore>) {
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        if let Err(err) = durable.archive_expired_idempotency(chrono::Utc::now()).await {
            tracing::warn!(error = %err, "idempotency archive sweep failed");
        }
    }
}

async fn run_backpressure_loop(monitor: Arc<BackpressureMonitor>, router: Arc<MessageRouter>, partition_pattern: String) {
    let Ok(subscription) = router.subscribe_ingress().await else {
        return;
    };
    let wildcard = partition_pattern.replace("{partition}", "*");
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        if let Err(err) = monitor.sample(subscription, &wildcard).await {
            tracing::warn!(error = %err, "backpressure sampling failed");
        }
    }
}

/// FAILED codes that can never succeed on broker redelivery (the message
/// itself is unprocessable), as opposed to transient codes where retrying
/// unchanged may succeed. REJECTED outcomes are always DLQ-routed above;
/// this only covers the FAILED branch.
fn is_terminal(code: &str) -> bool {
    matches!(code, "VALIDATION_FAILED")
}
